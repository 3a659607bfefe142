fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/deviceplugin/v1beta1/deviceplugin.proto");
    println!("cargo:rerun-if-changed=proto/podresources/v1alpha1/podresources.proto");

    tonic_build::configure()
        .format(true)
        .build_client(true)
        .build_server(true)
        .compile(
            &["proto/deviceplugin/v1beta1/deviceplugin.proto"],
            &["proto/deviceplugin/v1beta1"],
        )?;

    tonic_build::configure()
        .format(true)
        .build_client(true)
        .build_server(false)
        .compile(
            &["proto/podresources/v1alpha1/podresources.proto"],
            &["proto/podresources/v1alpha1"],
        )?;

    Ok(())
}
