use std::path::PathBuf;

fn main() {
    let protoc = protoc_bin_vendored::protoc_bin_path().expect("protoc not found");
    std::env::set_var("PROTOC", protoc);
    let out_dir = PathBuf::from(std::env::var("OUT_DIR").expect("OUT_DIR not set"));
    let proto_files = &[
        "proto/job.proto",
        "proto/submission.proto",
        "proto/execution.proto",
        "proto/tokendb.proto",
    ];
    let includes = &["proto"];

    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        // Descriptor set consumed by the reflection service on both listeners.
        .file_descriptor_set_path(out_dir.join("scheduler_descriptor.bin"))
        .compile_protos(proto_files, includes)
        .expect("failed to compile protos");
}
