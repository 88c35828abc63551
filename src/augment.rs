//! # Image pre-processing and augmentation
//!
//! Spectrogram images are decoded to RGB, resized to a square resolution,
//! center cropped, randomly flipped and rescaled to `[-1, 1]`, the range the
//! auto-encoder expects.
use image::{imageops, Rgb, RgbImage};
use rand::Rng;
use std::path::Path;

/// Source coordinates of a destination index along one axis: the two
/// neighbouring source indexes and the interpolation weight of the second.
fn bilinear_coords(len_out: u32, len_in: u32) -> Vec<(u32, u32, f32)> {
    let scale = len_in as f32 / len_out as f32;
    (0..len_out)
        .map(|dst| {
            let src = ((dst as f32 + 0.5) * scale - 0.5).max(0.);
            let lo = (src.floor() as u32).min(len_in - 1);
            let hi = (lo + 1).min(len_in - 1);
            (lo, hi, src - lo as f32)
        })
        .collect()
}

/// Bilinear resize with half-pixel centers and no antialiasing, each output
/// pixel only reads its four nearest source pixels even when downscaling.
pub fn resize_bilinear(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    let (in_width, in_height) = image.dimensions();
    if in_width == 0 || in_height == 0 {
        return RgbImage::new(width, height);
    }
    let xs = bilinear_coords(width, in_width);
    let ys = bilinear_coords(height, in_height);
    RgbImage::from_fn(width, height, |x, y| {
        let (x0, x1, wx) = xs[x as usize];
        let (y0, y1, wy) = ys[y as usize];
        let mut pixel = [0u8; 3];
        for (c, value) in pixel.iter_mut().enumerate() {
            let at = |x, y| image.get_pixel(x, y)[c] as f32;
            let top = at(x0, y0) * (1. - wx) + at(x1, y0) * wx;
            let bottom = at(x0, y1) * (1. - wx) + at(x1, y1) * wx;
            *value = (top * (1. - wy) + bottom * wy).round().clamp(0., 255.) as u8;
        }
        Rgb(pixel)
    })
}

/// Decodes an image as 3-channel RGB and resizes it (bilinear) to a
/// `resolution x resolution` square.
pub fn load_image<P: AsRef<Path>>(path: P, resolution: u32) -> anyhow::Result<RgbImage> {
    let path = path.as_ref();
    let image = image::open(path).map_err(|e| {
        anyhow::Error::new(e).context(format!("error decoding {:?}", path.to_string_lossy()))
    })?;
    let image = image.to_rgb8();
    if image.dimensions() == (resolution, resolution) {
        Ok(image)
    } else {
        Ok(resize_bilinear(&image, resolution, resolution))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Augmenter {
    pub resolution: u32,
    pub random_flip: bool,
}

impl Augmenter {
    pub fn new(resolution: u32) -> Self {
        Self { resolution, random_flip: true }
    }

    /// Crops the central `resolution x resolution` region. Images smaller than
    /// the target along either side are resized instead.
    pub fn center_crop(&self, image: RgbImage) -> RgbImage {
        let res = self.resolution;
        let (width, height) = image.dimensions();
        if width < res || height < res {
            return resize_bilinear(&image, res, res);
        }
        if (width, height) == (res, res) {
            return image;
        }
        let x = (width - res) / 2;
        let y = (height - res) / 2;
        imageops::crop_imm(&image, x, y, res, res).to_image()
    }

    /// Runs the full augmentation and returns the pixels in CHW order.
    pub fn apply<R: Rng>(&self, image: RgbImage, rng: &mut R) -> Vec<f32> {
        let mut image = self.center_crop(image);
        if self.random_flip && rng.gen_bool(0.5) {
            imageops::flip_horizontal_in_place(&mut image);
        }
        to_chw(&image)
    }
}

/// Rescales `[0, 255]` pixels to `[-1, 1]` and lays them out channel first.
pub fn to_chw(image: &RgbImage) -> Vec<f32> {
    let (width, height) = image.dimensions();
    let plane = (width * height) as usize;
    let mut data = vec![0f32; 3 * plane];
    for (x, y, pixel) in image.enumerate_pixels() {
        let offset = (y * width + x) as usize;
        for c in 0..3 {
            data[c * plane + offset] = pixel[c] as f32 / 127.5 - 1.;
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::tests::scratch_dir;
    use rand::{rngs::StdRng, SeedableRng};

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| Rgb([x as u8, y as u8, 7]))
    }

    #[test]
    fn rescales_to_unit_range() {
        let image = RgbImage::from_fn(2, 1, |x, _| if x == 0 { Rgb([0, 0, 0]) } else { Rgb([255; 3]) });
        let data = to_chw(&image);
        assert_eq!(data.len(), 6);
        // Channel-major layout: r0 r1 g0 g1 b0 b1.
        assert_eq!(data, [-1., 1., -1., 1., -1., 1.]);
    }

    #[test]
    fn crops_the_center() {
        let augmenter = Augmenter { resolution: 4, random_flip: false };
        let cropped = augmenter.center_crop(gradient(10, 8));
        assert_eq!(cropped.dimensions(), (4, 4));
        assert_eq!(cropped.get_pixel(0, 0), &Rgb([3, 2, 7]));
        let resized = augmenter.center_crop(gradient(2, 8));
        assert_eq!(resized.dimensions(), (4, 4));
    }

    #[test]
    fn flips_about_half_of_the_time() {
        let augmenter = Augmenter::new(8);
        let mut rng = StdRng::seed_from_u64(42);
        let image = gradient(8, 8);
        let plain = to_chw(&image);
        let flipped = (0..200).filter(|_| augmenter.apply(image.clone(), &mut rng) != plain).count();
        assert!((60..140).contains(&flipped), "{flipped}");
    }

    #[test]
    fn no_flip_when_disabled() {
        let augmenter = Augmenter { resolution: 8, random_flip: false };
        let mut rng = StdRng::seed_from_u64(0);
        let image = gradient(8, 8);
        for _ in 0..10 {
            assert_eq!(augmenter.apply(image.clone(), &mut rng), to_chw(&image));
        }
    }

    #[test]
    fn bilinear_downscale_reads_the_nearest_pixels() {
        let row = [0u8, 100, 200, 255];
        let image = RgbImage::from_fn(4, 1, |x, _| Rgb([row[x as usize]; 3]));
        let resized = resize_bilinear(&image, 2, 1);
        // Sampled at source x = 0.5 and x = 2.5, the outer pixels do not leak in.
        assert_eq!(resized.get_pixel(0, 0), &Rgb([50; 3]));
        assert_eq!(resized.get_pixel(1, 0), &Rgb([228; 3]));
    }

    #[test]
    fn bilinear_upscale_clamps_at_the_border() {
        let image = RgbImage::from_fn(2, 2, |x, y| Rgb([(x * 100) as u8, (y * 100) as u8, 9]));
        let resized = resize_bilinear(&image, 4, 4);
        assert_eq!(resized.get_pixel(0, 0), &Rgb([0, 0, 9]));
        assert_eq!(resized.get_pixel(3, 3), &Rgb([100, 100, 9]));
        assert_eq!(resized.get_pixel(1, 0), &Rgb([25, 0, 9]));
        assert_eq!(resize_bilinear(&image, 2, 2), image);
    }

    #[test]
    fn loads_and_resizes_png() {
        let dir = scratch_dir("augment-load");
        let path = dir.join("spec.png");
        image::GrayImage::from_fn(32, 16, |x, _| image::Luma([x as u8 * 8])).save(&path).unwrap();
        let image = load_image(&path, 8).unwrap();
        assert_eq!(image.dimensions(), (8, 8));
        let pixel = image.get_pixel(4, 4);
        assert_eq!(pixel[0], pixel[1]);
        assert_eq!(pixel[1], pixel[2]);
        assert!(load_image(dir.join("missing.png"), 8).is_err());
    }
}
