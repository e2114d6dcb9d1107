use std::env;
use std::io::Result;
use std::path::PathBuf;

fn main() -> Result<()> {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());

    tonic_build::configure()
        .file_descriptor_set_path(out_dir.join("dispatcher_descriptor.bin"))
        .compile_protos(
            &[
                "proto/dispatcher/v2/grpc_predict_v2.proto",
                "proto/dispatcher/management/v1/management.proto",
            ],
            &["proto/"],
        )?;

    Ok(())
}
