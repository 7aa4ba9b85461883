fn main() {
    let proto = "../../Docs/API/relay_v1.proto";
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path().expect("vendored protoc");
        std::env::set_var("PROTOC", protoc);
    }
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .type_attribute(".", "#[derive(serde::Serialize, serde::Deserialize)]")
        .type_attribute(".", "#[serde(default)]")
        .compile(&[proto], &["../../Docs/API"])
        .expect("proto build failed");
    println!("cargo:rerun-if-changed={}", proto);
}
