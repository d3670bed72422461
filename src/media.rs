//! Media loading
//!
//! Decoded bitmaps wait in the [`MediaQueue`] until the next prefill drains it.

use log::{error, info};

use crate::{
    backend::{Runtime, TokenSampler},
    error::Error,
    session::Session,
    utils::image::{fit_within, Image},
};

/// Bitmaps loaded since the last prefill, in load order.
#[derive(Debug)]
pub struct MediaQueue<B> {
    entries: Vec<B>,
}

impl<B> Default for MediaQueue<B> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<B> MediaQueue<B> {
    pub fn push(&mut self, bitmap: B) {
        self.entries.push(bitmap);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Takes every entry, leaving the queue empty.
    pub fn drain(&mut self) -> Vec<B> {
        std::mem::take(&mut self.entries)
    }
}

impl<R, S> Session<R, S>
where
    R: Runtime,
    S: TokenSampler<R>,
{
    /// Loads media from the specified file path
    ///
    /// Nothing is queued when decoding fails.
    pub fn load_media_file(&mut self, path: &str) -> Result<(), Error> {
        let bitmap = match self.image_max_resolution {
            Some(max_resolution) => {
                let image = Image::from_file(path)
                    .map_err(|e| Error::MediaDecode(format!("{path}: {e}")))?;
                match fit_within(&image, max_resolution)? {
                    Some(buffer) => self.runtime.bitmap_from_buffer(&buffer),
                    None => self.runtime.bitmap_from_file(path),
                }
            }
            None => self.runtime.bitmap_from_file(path),
        }
        .map_err(|e| {
            error!("load image from path failed: {path}, {e}");
            e
        })?;

        self.media.push(bitmap);
        info!("Loaded media {path}, {} queued", self.media.len());
        Ok(())
    }

    /// Loads media from an in-memory encoded image
    ///
    /// Nothing is queued when decoding fails.
    pub fn load_media_buffer(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            error!("load image from memory failed: empty buffer");
            return Err(Error::MediaDecode("empty buffer".to_string()));
        }

        let resized = match self.image_max_resolution {
            Some(max_resolution) => {
                let image = Image::from_buffer(data)
                    .map_err(|e| Error::MediaDecode(format!("buffer: {e}")))?;
                fit_within(&image, max_resolution)?
            }
            None => None,
        };

        let bitmap = self
            .runtime
            .bitmap_from_buffer(resized.as_deref().unwrap_or(data))
            .map_err(|e| {
                error!("load image from memory failed: {e}");
                e
            })?;

        self.media.push(bitmap);
        info!(
            "Loaded media buffer ({} bytes), {} queued",
            data.len(),
            self.media.len()
        );
        Ok(())
    }
}
