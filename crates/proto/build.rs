fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto");

    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile(
            &[
                "proto/hypervisor/v1/cluster.proto",
                "proto/hypervisor/v1/compute.proto",
                "proto/hypervisor/v1/agent.proto",
            ],
            &["proto"],
        )?;

    Ok(())
}
