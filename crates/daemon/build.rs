// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let fds = protox::compile(["../../proto/aviary/v1/aviary.proto"], ["../../proto"])?;

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_fds(fds)?;

    println!("cargo:rerun-if-changed=../../proto/aviary/v1/aviary.proto");
    Ok(())
}
