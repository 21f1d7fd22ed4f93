use std::fs::{create_dir_all, File};
use std::io::Write;
use std::path::PathBuf;

use burn::data::network::downloader;

/// How model parameters are keyed inside a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointLayout {
    /// Parameters stored under the `trunk_state_dict` key and named after the
    /// bare trunk.
    Trunk,
    /// Parameters stored under the `state_dict` key, with names prefixed by
    /// `model.backbone.` or `module.` as saved by a training harness.
    TrainingHarness,
}

/// Pre-trained weights metadata.
pub struct Weights {
    pub(crate) url: &'static str,
    pub(crate) layout: CheckpointLayout,
}

impl Weights {
    /// Download the pre-trained weights to the local cache directory.
    pub fn download(&self) -> Result<PathBuf, std::io::Error> {
        // Model cache directory
        let model_dir = dirs::home_dir()
            .expect("Should be able to get home directory")
            .join(".cache")
            .join("fmcib-burn");

        if !model_dir.exists() {
            create_dir_all(&model_dir)?;
        }

        // The URL may carry a query string (e.g., `?download=1`)
        let file_base_name = self
            .url
            .rsplit_once('/')
            .unwrap()
            .1
            .split('?')
            .next()
            .unwrap();
        let file_name = model_dir.join(file_base_name);
        if !file_name.exists() {
            // Download file content
            log::info!("Downloading pre-trained weights from {}", self.url);
            let bytes = downloader::download_file_as_bytes(self.url, file_base_name);

            // Write content to file
            let mut output_file = File::create(&file_name)?;
            let bytes_written = output_file.write(&bytes)?;

            if bytes_written != bytes.len() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "Failed to write the whole model weights file.",
                ));
            }
        }

        Ok(file_name)
    }
}

pub trait WeightsMeta {
    fn weights(&self) -> Weights;
}

/// FMCIB pre-trained weights.
pub enum Fmcib {
    /// Foundation model weights from the
    /// [foundation-cancer-image-biomarker](https://github.com/AIM-Harvard/foundation-cancer-image-biomarker)
    /// release, self-supervised pre-trained on CT lesion crops.
    /// The trunk produces 4096-wide features.
    FoundationV1,
}
impl WeightsMeta for Fmcib {
    fn weights(&self) -> Weights {
        Weights {
            url: "https://zenodo.org/records/10528450/files/model_weights.torch?download=1",
            layout: CheckpointLayout::Trunk,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foundation_weights_cache_under_clean_file_name() {
        let weights = Fmcib::FoundationV1.weights();
        let file_base_name = weights
            .url
            .rsplit_once('/')
            .unwrap()
            .1
            .split('?')
            .next()
            .unwrap();

        assert_eq!(file_base_name, "model_weights.torch");
        assert_eq!(weights.layout, CheckpointLayout::Trunk);
    }
}
