fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = std::path::PathBuf::from(std::env::var("OUT_DIR")?);

    // Compile protobuf definitions
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .file_descriptor_set_path(out_dir.join("pipecd_descriptor.bin"))
        .compile_protos(
            &[
                "proto/pipedservice.proto",
                "proto/webservice.proto",
                "proto/apiservice.proto",
                "proto/authz.proto",
            ],
            &["proto"],
        )?;

    Ok(())
}
