fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(false)
        .compile(&["proto/verifier/v1/verifier.proto"], &["proto"])?;
    Ok(())
}
