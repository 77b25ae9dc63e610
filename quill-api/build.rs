//! Build script to compile the log.v1 protobuf definitions.

use std::io::ErrorKind;
use std::{fs, io};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    idempotent_create_dir("src/generated")?;

    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .out_dir("src/generated")
        .compile(&["proto/log.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/log.proto");
    Ok(())
}

fn idempotent_create_dir(path: &str) -> io::Result<()> {
    match fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}
