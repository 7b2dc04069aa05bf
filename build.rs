fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        unsafe {
            std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
        }
    }

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(false)
        .compile_well_known_types(true)
        .compile_protos(&["proto/csi.proto"], &["proto"])?;

    Ok(())
}
