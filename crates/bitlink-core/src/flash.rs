//! Flash artifact preparation.
//!
//! Takes a firmware container, selects the region for the paired hardware,
//! and writes the files the platform flasher consumes: a plain application
//! hex for V1 partial flashing, and a DFU bundle (init packet + binary,
//! zipped) for V2 secure DFU.

use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::device::HardwareVersion;
use crate::hex::{select_region, HexError};

/// Size of the DFU init packet understood by the V2 bootloader.
pub const INIT_RECORD_SIZE: usize = 56;

/// Magic tag opening the init packet.
pub const INIT_RECORD_MAGIC: &[u8; 12] = b"microbit_app";

const HEX_FILE: &str = "application.hex";
const BIN_FILE: &str = "application.bin";
const DAT_FILE: &str = "application.dat";
const BUNDLE_FILE: &str = "update.zip";

#[derive(Error, Debug)]
pub enum FlashError {
    /// The container has no region for the paired hardware, or is malformed.
    #[error("incompatible firmware: {0}")]
    Incompatible(#[from] HexError),
    #[error("failed to write artifact: {0}")]
    WriteFailed(#[from] std::io::Error),
    #[error("failed to build bundle: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// How the prepared artifact is delivered to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashMethod {
    /// V1: partial flash of the application hex over BLE.
    PartialFlash,
    /// V2: secure DFU with the zipped init packet + binary.
    SecureDfu,
}

/// Handoff to the platform flasher.
#[derive(Debug, Clone)]
pub struct FlashRequest {
    pub method: FlashMethod,
    /// Artifact the flasher consumes: the hex for partial flash, the zip
    /// bundle for secure DFU.
    pub path: PathBuf,
    pub hardware: HardwareVersion,
    /// Transport address of the target device.
    pub device_address: String,
    /// Base flash address of the selected region.
    pub app_base: u32,
    pub app_size: u32,
}

/// Progress reported back by the platform flasher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashStatus {
    Started,
    /// Percent complete, 0..=100.
    Progress(u8),
    Complete {
        /// Partial flash was refused and a full DFU should be tried instead.
        attempt_dfu_fallback: bool,
    },
    /// Platform-specific failure code.
    Failed(i32),
    Aborted,
}

/// Build the 56-byte DFU init packet for an application of `app_size` bytes.
///
/// Layout: magic tag at offset 0, format version 1 (u32 LE) at 12, the
/// application size (u32 LE) at 16, zero padding to 56.
pub fn build_init_record(app_size: u32) -> [u8; INIT_RECORD_SIZE] {
    let mut record = [0u8; INIT_RECORD_SIZE];
    record[..INIT_RECORD_MAGIC.len()].copy_from_slice(INIT_RECORD_MAGIC);
    record[12..16].copy_from_slice(&1u32.to_le_bytes());
    record[16..20].copy_from_slice(&app_size.to_le_bytes());
    record
}

/// Zip the init packet and application binary into a DFU bundle.
pub fn package_bundle(init: &[u8], binary: &[u8]) -> Result<Vec<u8>, FlashError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();

    writer.start_file(DAT_FILE, options)?;
    writer.write_all(init)?;
    writer.start_file(BIN_FILE, options)?;
    writer.write_all(binary)?;

    Ok(writer.finish()?.into_inner())
}

/// Prepare flash artifacts for `hardware` from a firmware container.
///
/// Writes `application.hex` and `application.bin` to `out_dir`; for V2 also
/// `application.dat` and the `update.zip` DFU bundle. Returns the handoff
/// describing which artifact to flash, how, and to which device.
pub fn prepare(
    container: &[u8],
    hardware: HardwareVersion,
    device_address: &str,
    out_dir: &Path,
) -> Result<FlashRequest, FlashError> {
    let image = select_region(container, hardware)?;
    debug!(%hardware, size = image.binary_size(), base = format_args!("{:#x}", image.base), "region extracted");

    fs::create_dir_all(out_dir)?;
    fs::write(out_dir.join(HEX_FILE), image.hex.as_bytes())?;
    fs::write(out_dir.join(BIN_FILE), &image.binary)?;

    let request = match hardware {
        HardwareVersion::V2 => {
            let init = build_init_record(image.binary_size());
            fs::write(out_dir.join(DAT_FILE), init)?;

            let bundle = package_bundle(&init, &image.binary)?;
            let path = out_dir.join(BUNDLE_FILE);
            fs::write(&path, &bundle)?;
            FlashRequest {
                method: FlashMethod::SecureDfu,
                path,
                hardware,
                device_address: device_address.to_string(),
                app_base: image.base,
                app_size: image.binary_size(),
            }
        }
        _ => FlashRequest {
            method: FlashMethod::PartialFlash,
            path: out_dir.join(HEX_FILE),
            hardware,
            device_address: device_address.to_string(),
            app_base: image.base,
            app_size: image.binary_size(),
        },
    };

    info!(%hardware, method = ?request.method, path = %request.path.display(), "flash artifacts prepared");
    Ok(request)
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;
    use crate::hex::record::{HexRecord, RecordKind};

    fn container_for(id: u16, addr: u32, data: &[u8]) -> Vec<u8> {
        let mut start = id.to_be_bytes().to_vec();
        start.extend_from_slice(&[0xC0, 0xDE]);
        let mut out = String::new();
        out.push_str(
            &HexRecord {
                address: 0,
                kind: RecordKind::BlockStart,
                data: start,
            }
            .emit(),
        );
        out.push('\n');
        out.push_str(&HexRecord::ext_linear((addr >> 16) as u16).emit());
        out.push('\n');
        for (i, chunk) in data.chunks(16).enumerate() {
            out.push_str(
                &HexRecord {
                    address: addr as u16 + i as u16 * 16,
                    kind: RecordKind::CustomData,
                    data: chunk.to_vec(),
                }
                .emit(),
            );
            out.push('\n');
        }
        out.push_str(
            &HexRecord {
                address: 0,
                kind: RecordKind::BlockEnd,
                data: vec![0; 4],
            }
            .emit(),
        );
        out.push('\n');
        out.push_str(&HexRecord::end_of_file().emit());
        out.into_bytes()
    }

    #[test]
    fn test_init_record_layout() {
        let record = build_init_record(0x1234);
        assert_eq!(record.len(), 56);
        assert_eq!(&record[..12], b"microbit_app");
        assert_eq!(u32::from_le_bytes(record[12..16].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(record[16..20].try_into().unwrap()), 0x1234);
        assert!(record[20..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_bundle_contains_dat_and_bin() {
        let init = build_init_record(3);
        let bundle = package_bundle(&init, &[0xAA, 0xBB, 0xCC]).unwrap();

        let mut archive = zip::ZipArchive::new(Cursor::new(bundle)).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert!(names.contains(&"application.dat".to_string()));
        assert!(names.contains(&"application.bin".to_string()));

        let mut bin = Vec::new();
        archive
            .by_name("application.bin")
            .unwrap()
            .read_to_end(&mut bin)
            .unwrap();
        assert_eq!(bin, vec![0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_prepare_v2_writes_dfu_bundle() {
        let data = [0x5Au8; 48];
        let container = container_for(0x9903, 0x1C000, &data);
        let dir = tempfile::tempdir().unwrap();

        let request =
            prepare(&container, HardwareVersion::V2, "D3:14:15:92:65:35", dir.path()).unwrap();
        assert_eq!(request.method, FlashMethod::SecureDfu);
        assert_eq!(request.device_address, "D3:14:15:92:65:35");
        assert_eq!(request.app_size, 48);
        assert_eq!(request.app_base, 0x1C000);
        assert!(dir.path().join("application.hex").exists());
        assert!(dir.path().join("application.bin").exists());
        assert!(dir.path().join("application.dat").exists());
        assert_eq!(request.path, dir.path().join("update.zip"));

        let dat = fs::read(dir.path().join("application.dat")).unwrap();
        assert_eq!(dat.len(), 56);
        assert_eq!(u32::from_le_bytes(dat[16..20].try_into().unwrap()), 48);
    }

    #[test]
    fn test_prepare_v1_hands_off_hex() {
        let data = [0x11u8; 16];
        let container = container_for(0x9900, 0x18000, &data);
        let dir = tempfile::tempdir().unwrap();

        let request =
            prepare(&container, HardwareVersion::V1, "D3:14:15:92:65:35", dir.path()).unwrap();
        assert_eq!(request.method, FlashMethod::PartialFlash);
        assert_eq!(request.path, dir.path().join("application.hex"));
        assert!(!dir.path().join("update.zip").exists());
    }

    #[test]
    fn test_prepare_incompatible_container() {
        let data = [0u8; 16];
        let container = container_for(0x9900, 0x18000, &data);
        let dir = tempfile::tempdir().unwrap();

        let err = prepare(&container, HardwareVersion::V2, "", dir.path()).unwrap_err();
        assert!(matches!(err, FlashError::Incompatible(_)));
    }
}
