use std::{env, fs, path::PathBuf};

// Copy settings.json next to the built binary so `Settings::load` finds it
// when the server is started from the target directory.
fn main() {
    println!("cargo:rerun-if-changed=settings.json");

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let Some(target_dir) = out_dir.ancestors().nth(3) else {
        println!("cargo:warning=cannot locate target directory, settings.json not copied");
        return;
    };

    if let Err(e) = fs::copy("settings.json", target_dir.join("settings.json")) {
        println!("cargo:warning=settings.json not copied: {e}");
    }
}
