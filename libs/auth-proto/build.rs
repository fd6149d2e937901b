fn main() {
    println!("cargo:rerun-if-changed=proto/auth.proto");

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/auth.proto"], &["proto"])
        .expect("failed to compile auth.proto");
}
