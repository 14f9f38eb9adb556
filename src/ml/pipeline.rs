use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};
use ndarray::{Array4, Axis};

/// Input side length of the WD-style taggers.
pub const DEFAULT_INPUT_SIZE: u32 = 448;

/// Pads `image` onto a white square canvas, keeping it centred.
pub fn pad_to_square(image: &DynamicImage) -> RgbImage {
    let rgb = image.to_rgb8();
    let (w, h) = rgb.dimensions();
    let side = w.max(h);
    if w == h {
        return rgb;
    }

    let mut canvas = RgbImage::from_pixel(side, side, Rgb([255, 255, 255]));
    let x = i64::from((side - w) / 2);
    let y = i64::from((side - h) / 2);
    imageops::overlay(&mut canvas, &rgb, x, y);
    canvas
}

/// One image as an `[size, size, 3]` BGR tensor with values in 0..=255.
pub fn normalize_for_tagger(image: &DynamicImage, size: u32) -> Array4<f32> {
    let square = pad_to_square(image);
    let resized = if square.width() == size {
        square
    } else {
        imageops::resize(&square, size, size, FilterType::CatmullRom)
    };

    let side = size as usize;
    let mut array = Array4::<f32>::zeros((1, side, side, 3));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        array[[0, y, x, 0]] = f32::from(pixel[2]);
        array[[0, y, x, 1]] = f32::from(pixel[1]);
        array[[0, y, x, 2]] = f32::from(pixel[0]);
    }
    array
}

/// Stacks several images into one `[n, size, size, 3]` batch.
pub fn prepare_batch(images: &[DynamicImage], size: u32) -> Array4<f32> {
    let side = size as usize;
    let mut batch = Array4::<f32>::zeros((images.len(), side, side, 3));
    for (mut slot, image) in batch.axis_iter_mut(Axis(0)).zip(images) {
        let single = normalize_for_tagger(image, size);
        slot.assign(&single.index_axis(Axis(0), 0));
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_images_are_padded_with_white() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 2, Rgb([10, 20, 30])));
        let square = pad_to_square(&img);

        assert_eq!(square.dimensions(), (4, 4));
        assert_eq!(square.get_pixel(0, 0), &Rgb([255, 255, 255]));
        assert_eq!(square.get_pixel(0, 1), &Rgb([10, 20, 30]));
        assert_eq!(square.get_pixel(3, 3), &Rgb([255, 255, 255]));
    }

    #[test]
    fn channels_are_bgr_in_pixel_units() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(2, 2, Rgb([10, 20, 30])));
        let tensor = normalize_for_tagger(&img, 2);

        assert_eq!(tensor.shape(), &[1, 2, 2, 3]);
        assert_eq!(tensor[[0, 1, 1, 0]], 30.0);
        assert_eq!(tensor[[0, 1, 1, 1]], 20.0);
        assert_eq!(tensor[[0, 1, 1, 2]], 10.0);
    }

    #[test]
    fn batch_stacks_along_the_first_axis() {
        let red = DynamicImage::ImageRgb8(RgbImage::from_pixel(3, 3, Rgb([255, 0, 0])));
        let blue = DynamicImage::ImageRgb8(RgbImage::from_pixel(3, 3, Rgb([0, 0, 255])));
        let batch = prepare_batch(&[red, blue], 3);

        assert_eq!(batch.shape(), &[2, 3, 3, 3]);
        assert_eq!(batch[[0, 0, 0, 2]], 255.0);
        assert_eq!(batch[[1, 0, 0, 0]], 255.0);
        assert_eq!(batch[[1, 0, 0, 2]], 0.0);
    }
}
