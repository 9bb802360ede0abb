fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use vendored protoc so we don't rely on system protoc
    let protoc = protoc_bin_vendored::protoc_bin_path().expect("vendored protoc");
    std::env::set_var("PROTOC", protoc);

    // Only the message types are needed; the receiver speaks no gRPC itself
    tonic_build::configure()
        .build_server(false)
        .build_client(false)
        .compile(
            &[
                "proto/opentelemetry/proto/common/v1/common.proto",
                "proto/opentelemetry/proto/resource/v1/resource.proto",
                "proto/opentelemetry/proto/trace/v1/trace.proto",
                "proto/opentelemetry/proto/logs/v1/logs.proto",
                "proto/opentelemetry/proto/metrics/v1/metrics.proto",
            ],
            &["proto"],
        )?;
    Ok(())
}
