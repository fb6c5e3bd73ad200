fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use the vendored protoc binary so codegen works without a system install.
    if let Ok(protoc) = protoc_bin_vendored::protoc_bin_path() {
        std::env::set_var("PROTOC", protoc);
    }

    // Compile the container storage plugin contract
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/csi.proto"], &["proto"])?;

    Ok(())
}
