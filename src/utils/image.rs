//! 图像处理工具
use std::io::Cursor;

use image::{imageops::FilterType, DynamicImage, ImageFormat};
use log::{error, info};

use crate::error::Error;

/// 图像处理工具
#[derive(Debug, Clone)]
pub struct Image {
    img: DynamicImage,
}

impl Image {
    /// 从文件加载图像
    pub fn from_file(path: &str) -> Result<Self, Error> {
        let img = image::open(path).map_err(|e| {
            error!("Failed to open image {path}: {e}");
            e
        })?;

        Ok(Image { img })
    }

    /// 从内存加载图像
    pub fn from_buffer(data: &[u8]) -> Result<Self, Error> {
        if data.is_empty() {
            return Err(Error::ImageBuffer);
        }
        let img = image::load_from_memory(data).map_err(|e| {
            error!("Failed to decode image buffer: {e}");
            e
        })?;

        Ok(Image { img })
    }

    /// 按最长边缩放, 保持宽高比
    pub fn resize_to_longest(&self, length: u32) -> Self {
        let img = self.img.resize(length, length, FilterType::Lanczos3);
        Image { img }
    }

    /// 获取最长边
    pub fn longest(&self) -> u32 {
        self.width().max(self.height())
    }

    /// 图像转换为 PNG buffer
    pub fn to_png(&self) -> Result<Vec<u8>, Error> {
        let mut buffer = Vec::new();
        self.img
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)?;

        Ok(buffer)
    }

    /// 宽度
    pub fn width(&self) -> u32 {
        self.img.width()
    }

    /// 高度
    pub fn height(&self) -> u32 {
        self.img.height()
    }
}

/// Downscales the image when its longest side exceeds `max_resolution`.
///
/// Returns the re-encoded PNG, or `None` when the image already fits.
pub fn fit_within(image: &Image, max_resolution: u32) -> Result<Option<Vec<u8>>, Error> {
    if image.longest() <= max_resolution {
        return Ok(None);
    }

    let resized = image.resize_to_longest(max_resolution);
    info!(
        "Image resized {}x{} -> {}x{}",
        image.width(),
        image.height(),
        resized.width(),
        resized.height()
    );
    resized.to_png().map(Some)
}

#[cfg(test)]
pub(crate) mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    /// PNG bytes of a solid image, shared with the session tests.
    pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([200, 30, 30]));
        let mut buffer = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .expect("encode png");
        buffer
    }

    #[test]
    fn test_fit_within() -> anyhow::Result<()> {
        let image = Image::from_buffer(&png_bytes(64, 32))?;
        assert_eq!(image.longest(), 64);

        let resized = fit_within(&image, 16)?.expect("downscaled");
        let resized = Image::from_buffer(&resized)?;
        assert_eq!((resized.width(), resized.height()), (16, 8));

        assert!(fit_within(&image, 64)?.is_none());
        Ok(())
    }

    #[test]
    fn test_invalid_buffer() {
        assert!(matches!(Image::from_buffer(&[]), Err(Error::ImageBuffer)));
        assert!(Image::from_buffer(b"not an image").is_err());
    }
}
