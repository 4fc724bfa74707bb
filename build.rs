fn main() -> Result<(), Box<dyn std::error::Error>> {
    let contract = "proto/runtime.proto";

    println!("cargo:rerun-if-changed={contract}");
    tonic_build::configure()
        .build_server(false)
        .build_transport(false)
        .compile_protos(&[contract], &["proto"])?;
    Ok(())
}
