fn main() {
    println!("cargo:rerun-if-changed=proto/user.proto");

    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(&["proto/user.proto"], &["proto"])
        .expect("failed to compile user.proto");
}
