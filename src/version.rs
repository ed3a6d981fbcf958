// Version strings for the boot banner and for what the device reports upstream

/// Cargo package version from Cargo.toml
pub const CARGO_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Bytes of the image hash appended to the reported version
const BUILD_ID_BYTES: usize = 4;

/// Version sent in status replies and state snapshots, e.g. `0.3.2+1a2b3c4d`.
/// Two builds of the same Cargo version still tell apart by the build id.
pub fn reported_version(elf_sha256: Option<&[u8]>) -> String {
    match elf_sha256 {
        Some(hash) if !hash.is_empty() => {
            let id: String = hash
                .iter()
                .take(BUILD_ID_BYTES)
                .map(|b| format!("{:02x}", b))
                .collect();
            format!("{}+{}", CARGO_VERSION, id)
        }
        _ => CARGO_VERSION.to_string(),
    }
}

/// ELF hash of the running image, from the app descriptor.
#[cfg(target_os = "espidf")]
pub fn running_elf_sha256() -> Option<[u8; 32]> {
    let desc = unsafe { esp_idf_sys::esp_app_get_description() };
    if desc.is_null() {
        return None;
    }
    Some(unsafe { (*desc).app_elf_sha256 })
}
