//! Generated gRPC/protobuf types for the inference Dispatcher.
//!
//! This crate only contains the wire schema (`proto/`) and the generated
//! Rust bindings for it; it carries no business logic.

pub mod proto {
    pub mod dispatcher {
        pub mod v2 {
            tonic::include_proto!("dispatcher.v2");
        }
        pub mod management {
            pub mod v1 {
                tonic::include_proto!("dispatcher.management.v1");
            }
        }
    }

    /// Encoded `FileDescriptorSet` for both services, used to back the
    /// reflection service exposed by the Dispatcher binary.
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("dispatcher_descriptor");
}
