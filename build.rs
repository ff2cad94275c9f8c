fn main() {
    // ESP-IDF build configuration; host builds only compile the core and the simulator
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();
    }

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=PROVISION_TRIGGER_PIN");
    println!("cargo:rerun-if-env-changed=PROVISION_TRIGGER_PULL");
    println!("cargo:rerun-if-env-changed=PROVISION_TRIGGER_EDGE");
}
