use image::imageops::{self, FilterType};
use image::GrayImage;
use tracing::{debug, instrument, trace};

use super::{Detector, DetectorError};
use crate::DetectConfig;

/// QR detector: decompresses with `image`, searches and decodes grids with `rqrr`.
pub struct QrDetector {
    config: DetectConfig,
    reader: Option<Reader>,
}

/// Per-session reader state.
#[derive(Debug, Default)]
struct Reader {
    scans: u64,
    decoded: u64,
    misreads: u64,
}

impl QrDetector {
    pub fn new(config: DetectConfig) -> Self {
        Self {
            config,
            reader: None,
        }
    }

    fn downscale(&self, luma: GrayImage) -> GrayImage {
        let max = self.config.max_dimension;
        let (w, h) = luma.dimensions();
        if max == 0 || (w <= max && h <= max) {
            return luma;
        }
        let scale = f64::from(max) / f64::from(w.max(h));
        let nw = ((f64::from(w) * scale).round() as u32).max(1);
        let nh = ((f64::from(h) * scale).round() as u32).max(1);
        imageops::resize(&luma, nw, nh, FilterType::Triangle)
    }
}

impl Default for QrDetector {
    fn default() -> Self {
        Self::new(DetectConfig::default())
    }
}

impl Detector for QrDetector {
    fn initialize(&mut self) -> Result<(), DetectorError> {
        self.reader = Some(Reader::default());
        debug!(max_dimension = self.config.max_dimension, "QR reader initialised");
        Ok(())
    }

    #[instrument(level = "trace", skip_all, fields(len = encoded.len()))]
    fn detect(&mut self, encoded: &[u8]) -> Result<Vec<String>, DetectorError> {
        if self.reader.is_none() {
            return Err(DetectorError::NotInitialized);
        }

        let luma = image::load_from_memory(encoded)
            .map_err(|e| DetectorError::DecodeFailure(e.to_string()))?
            .to_luma8();
        let luma = self.downscale(luma);

        let mut prepared = rqrr::PreparedImage::prepare_from_greyscale(
            luma.width() as usize,
            luma.height() as usize,
            |x, y| luma.get_pixel(x as u32, y as u32)[0],
        );

        let mut payloads = Vec::new();
        let mut misreads = 0;
        for grid in prepared.detect_grids() {
            match grid.decode() {
                Ok((_, content)) => payloads.push(content),
                Err(err) => {
                    misreads += 1;
                    trace!("grid found but not decodable: {err}");
                }
            }
        }

        if let Some(reader) = self.reader.as_mut() {
            reader.scans += 1;
            reader.decoded += payloads.len() as u64;
            reader.misreads += misreads;
        }
        Ok(payloads)
    }

    fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            debug!(
                scans = reader.scans,
                decoded = reader.decoded,
                misreads = reader.misreads,
                "QR reader closed"
            );
        }
    }

    fn is_initialized(&self) -> bool {
        self.reader.is_some()
    }
}
