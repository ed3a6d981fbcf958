// Dual-bank flash behind FirmwareStore, on the raw ESP-IDF OTA API

use core::ffi::c_void;
use device_core::ota::{FirmwareStore, ImageState, OtaError};
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use esp_idf_sys::{
    esp, esp_ota_abort, esp_ota_begin, esp_ota_check_rollback_is_possible, esp_ota_end,
    esp_ota_get_last_invalid_partition, esp_ota_get_next_update_partition,
    esp_ota_get_running_partition, esp_ota_get_state_partition, esp_ota_handle_t,
    esp_ota_img_states_t, esp_ota_img_states_t_ESP_OTA_IMG_PENDING_VERIFY,
    esp_ota_mark_app_valid_cancel_rollback, esp_ota_set_boot_partition, esp_ota_write,
    esp_partition_t, EspError, ESP_ERR_OTA_VALIDATE_FAILED, OTA_SIZE_UNKNOWN,
};

const FLASH_NAMESPACE: &str = "saphari_ota";
/// Address of the last reverted bank we already reported
const REPORTED_REVERT_KEY: &str = "reverted_at";

pub struct EspFirmwareStore {
    handle: Option<esp_ota_handle_t>,
    target: *const esp_partition_t,
    written: usize,
    nvs: EspNvs<NvsDefault>,
}

impl EspFirmwareStore {
    pub fn new(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, FLASH_NAMESPACE, true)?;
        Ok(Self {
            handle: None,
            target: core::ptr::null(),
            written: 0,
            nvs,
        })
    }

    /// A bank the bootloader gave up on that we have not reported yet.
    fn unreported_revert(&mut self) -> bool {
        let invalid = unsafe { esp_ota_get_last_invalid_partition() };
        if invalid.is_null() {
            return false;
        }
        let address = unsafe { (*invalid).address };
        if matches!(self.nvs.get_u32(REPORTED_REVERT_KEY), Ok(Some(seen)) if seen == address) {
            return false;
        }
        if let Err(e) = self.nvs.set_u32(REPORTED_REVERT_KEY, address) {
            log::warn!("Could not remember reverted bank 0x{:x}: {:?}", address, e);
        }
        true
    }
}

fn store_err(op: &str, e: EspError) -> OtaError {
    OtaError::Store(format!("{}: {}", op, e))
}

impl FirmwareStore for EspFirmwareStore {
    fn running_image(&mut self) -> ImageState {
        let running = unsafe { esp_ota_get_running_partition() };
        let mut state: esp_ota_img_states_t = 0;
        let pending = !running.is_null()
            && esp!(unsafe { esp_ota_get_state_partition(running, &mut state) }).is_ok()
            && state == esp_ota_img_states_t_ESP_OTA_IMG_PENDING_VERIFY;
        if pending {
            log::info!("Running image is pending verification");
            ImageState::PendingVerify
        } else if self.unreported_revert() {
            log::warn!("Bootloader reverted a failed image");
            ImageState::Reverted
        } else {
            ImageState::Valid
        }
    }

    fn begin(&mut self, size_hint: Option<u64>) -> Result<(), OtaError> {
        self.discard();
        let target = unsafe { esp_ota_get_next_update_partition(core::ptr::null()) };
        if target.is_null() {
            return Err(OtaError::Store("no update partition".into()));
        }
        let bank_size = unsafe { (*target).size } as u64;
        if let Some(size) = size_hint {
            if size > bank_size {
                return Err(OtaError::TooLarge(size));
            }
        }

        let mut handle: esp_ota_handle_t = 0;
        let image_size = size_hint.map_or(OTA_SIZE_UNKNOWN as usize, |s| s as usize);
        esp!(unsafe { esp_ota_begin(target, image_size as _, &mut handle) })
            .map_err(|e| store_err("begin", e))?;

        log::info!("Writing update to bank at 0x{:x}", unsafe { (*target).address });
        self.handle = Some(handle);
        self.target = target;
        self.written = 0;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), OtaError> {
        let handle = self
            .handle
            .ok_or_else(|| OtaError::Store("write without begin".into()))?;
        esp!(unsafe { esp_ota_write(handle, data.as_ptr() as *const c_void, data.len() as _) })
            .map_err(|e| store_err("write", e))?;
        self.written += data.len();
        Ok(())
    }

    fn discard(&mut self) {
        if let Some(handle) = self.handle.take() {
            log::debug!("Discarding {} written bytes", self.written);
            unsafe {
                esp_ota_abort(handle);
            }
        }
        self.written = 0;
    }

    fn finish(&mut self) -> Result<(), OtaError> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| OtaError::Store("finish without begin".into()))?;
        let result = unsafe { esp_ota_end(handle) };
        if result == ESP_ERR_OTA_VALIDATE_FAILED as i32 {
            return Err(OtaError::Store("image header failed validation".into()));
        }
        esp!(result).map_err(|e| store_err("end", e))
    }

    fn activate(&mut self) -> Result<(), OtaError> {
        if self.target.is_null() {
            return Err(OtaError::Store("no finished image to activate".into()));
        }
        esp!(unsafe { esp_ota_set_boot_partition(self.target) })
            .map_err(|e| store_err("set boot partition", e))?;
        // A fresh image supersedes any earlier revert
        let _ = self.nvs.remove(REPORTED_REVERT_KEY);
        Ok(())
    }

    fn mark_valid(&mut self) -> Result<(), OtaError> {
        esp!(unsafe { esp_ota_mark_app_valid_cancel_rollback() })
            .map_err(|e| store_err("mark valid", e))
    }

    /// The switch itself happens in `restart_rolling_back`, which marks this
    /// image invalid and reboots in one step.
    fn rollback(&mut self) -> Result<(), OtaError> {
        if unsafe { esp_ota_check_rollback_is_possible() } {
            Ok(())
        } else {
            Err(OtaError::Rollback("no previous image to boot".into()))
        }
    }
}

impl Drop for EspFirmwareStore {
    fn drop(&mut self) {
        self.discard();
    }
}

/// Mark the running image invalid and reboot into the previous bank.
pub fn restart_rolling_back() -> ! {
    log::warn!("Rolling back to previous firmware");
    unsafe {
        // Only returns if there is nothing to roll back to
        esp_idf_sys::esp_ota_mark_app_invalid_rollback_and_reboot();
        esp_idf_sys::esp_restart()
    }
}
