// HTTPS firmware download behind the core ImageSource trait

use std::time::Duration;

use device_core::ota::{Chunk, DownloadError, ImageSource};
use esp_idf_svc::http::client::{Configuration, EspHttpConnection};
use esp_idf_svc::http::Method;
use esp_idf_sys::EspError;

pub struct HttpsImageSource {
    timeout: Duration,
    connection: Option<EspHttpConnection>,
}

impl HttpsImageSource {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            connection: None,
        }
    }
}

fn classify(e: EspError) -> DownloadError {
    match e.code() as u32 {
        esp_idf_sys::ESP_ERR_TIMEOUT | esp_idf_sys::ESP_ERR_HTTP_EAGAIN => DownloadError::Timeout,
        esp_idf_sys::ESP_ERR_HTTP_CONNECT | esp_idf_sys::ESP_ERR_HTTP_CONNECTION_CLOSED => {
            DownloadError::Reset
        }
        _ => DownloadError::Io(e.to_string()),
    }
}

impl ImageSource for HttpsImageSource {
    fn open(&mut self, url: &str) -> Result<Option<u64>, DownloadError> {
        self.close();

        let mut connection = EspHttpConnection::new(&Configuration {
            buffer_size: Some(4096),
            buffer_size_tx: Some(1024),
            timeout: Some(self.timeout),
            crt_bundle_attach: Some(esp_idf_sys::esp_crt_bundle_attach),
            ..Default::default()
        })
        .map_err(classify)?;

        connection
            .initiate_request(Method::Get, url, &[("Accept", "application/octet-stream")])
            .map_err(classify)?;
        connection.initiate_response().map_err(classify)?;

        let status = connection.status();
        if status != 200 {
            log::warn!("Image request returned HTTP {}", status);
            return Err(DownloadError::Http(status));
        }
        let length = connection
            .header("Content-Length")
            .and_then(|v| v.trim().parse::<u64>().ok());
        log::info!(
            "Image download started, content length {}",
            length.map_or_else(|| "unknown".to_string(), |l| l.to_string())
        );

        self.connection = Some(connection);
        Ok(length)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<Chunk, DownloadError> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| DownloadError::Io("read without open".into()))?;
        match connection.read(buf) {
            Ok(0) => Ok(Chunk::Done),
            Ok(n) => Ok(Chunk::Data(n)),
            Err(e) if e.code() as u32 == esp_idf_sys::ESP_ERR_HTTP_EAGAIN => Ok(Chunk::Pending),
            Err(e) => Err(classify(e)),
        }
    }

    fn close(&mut self) {
        self.connection = None;
    }
}
