use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path()?;
        // SAFETY: build scripts are single-threaded.
        unsafe { std::env::set_var("PROTOC", protoc) };
    }
    let well_known = protoc_bin_vendored::include_path()?;

    let proto_root = PathBuf::from("proto");
    let protos = [
        "build/bazel/semver/semver.proto",
        "build/bazel/remote/execution/v2/remote_execution.proto",
        "google/bytestream/bytestream.proto",
        "google/rpc/status.proto",
    ]
    .map(|p| proto_root.join(p));

    for proto in &protos {
        println!("cargo:rerun-if-changed={}", proto.display());
    }

    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);

    tonic_build::configure()
        .bytes(["."])
        .file_descriptor_set_path(out_dir.join("larder_descriptor.bin"))
        .compile_protos(&protos, &[proto_root, well_known])?;
    Ok(())
}
