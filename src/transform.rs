//! Image transformation engine
//!
//! Pipeline: decode, EXIF-aware orientation, crop, resize, rotate, flip,
//! encode. Requests whose options carry no pixel-level transformation bypass
//! the pipeline entirely and return the source bytes unchanged, which also
//! preserves byte identity for formats with non-canonical encoders.

use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use image::codecs::gif::{GifDecoder, GifEncoder, Repeat};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{AnimationDecoder, DynamicImage, Frame, GenericImageView, ImageFormat, ImageReader};
use tracing::{debug, warn};

use crate::error::{ProxyError, Result};
use crate::metrics::Statser;
use crate::options::{Options, OutputFormat};

/// Default compression quality of re-encoded JPEGs.
pub const DEFAULT_QUALITY: u8 = 95;

/// Default ceiling on pixel-count growth when scaling up (a 100x100 image
/// resized to 200x200 is a 4x increase, not 2x).
pub const DEFAULT_MAX_SCALE_UP: f64 = 2.0;

/// EXIF metadata is searched in at most this much of the input.
const MAX_EXIF_SIZE: usize = 1024 * 1024;

/// Applies [`Options`] to encoded images.
pub struct Transformer {
    max_scale_up: f64,
    filter: FilterType,
    statser: Arc<dyn Statser>,
}

impl Transformer {
    pub fn new(max_scale_up: f64, statser: Arc<dyn Statser>) -> Self {
        Transformer {
            max_scale_up,
            filter: FilterType::Lanczos3,
            statser,
        }
    }

    /// Override the resample filter. Tests use simpler filters whose output
    /// is exactly predictable; production keeps Lanczos.
    pub fn with_filter(mut self, filter: FilterType) -> Self {
        self.filter = filter;
        self
    }

    /// Transform the encoded image `data` according to `opt`, returning a
    /// similarly encoded image.
    pub fn transform(&self, data: Bytes, opt: &Options, url: &str) -> Result<Bytes> {
        if !opt.transform() {
            self.statser.increment("transform.noop");
            return Ok(data);
        }

        self.statser.increment("transform.request");
        let timer = self.statser.new_timing();

        let in_format = image::guess_format(&data)
            .map_err(|e| ProxyError::InvalidImage(e.to_string()))?;
        let out_format = output_format(in_format, opt)
            .ok_or_else(|| ProxyError::Transform(format!("unsupported format: {in_format:?}")))?;

        debug!(
            "transform: url={url}, input={in_format:?}, output={out_format:?}, options={opt}"
        );

        let result = if in_format == ImageFormat::Gif && out_format == OutputFormat::Gif {
            self.transform_gif(&data, opt)
        } else {
            self.transform_static(&data, in_format, out_format, opt)
        };

        timer.send(self.statser.as_ref(), "transform.time.total");
        result.map(Bytes::from)
    }

    fn transform_static(
        &self,
        data: &[u8],
        in_format: ImageFormat,
        out_format: OutputFormat,
        opt: &Options,
    ) -> Result<Vec<u8>> {
        let decode_timer = self.statser.new_timing();
        let mut img = ImageReader::with_format(Cursor::new(data), in_format)
            .decode()
            .map_err(|e| ProxyError::InvalidImage(e.to_string()))?;
        decode_timer.send(self.statser.as_ref(), "transform.time.decode");

        // camera orientation applies before any user-requested transform
        if matches!(in_format, ImageFormat::Jpeg | ImageFormat::Tiff) {
            let orientation = read_exif_orientation(data);
            if orientation != 1 {
                debug!("applying exif orientation {orientation}");
                img = apply_orientation(img, orientation);
            }
        }

        let img = self.transform_image(img, opt);
        encode(&img, out_format, opt.quality)
    }

    /// GIFs are processed frame by frame so animations survive: each frame
    /// is transformed with the same options and re-encoded with its delay
    /// preserved.
    fn transform_gif(&self, data: &[u8], opt: &Options) -> Result<Vec<u8>> {
        let decoder =
            GifDecoder::new(Cursor::new(data)).map_err(|e| ProxyError::InvalidImage(e.to_string()))?;

        let mut out = Vec::new();
        {
            let mut encoder = GifEncoder::new(&mut out);
            encoder
                .set_repeat(Repeat::Infinite)
                .map_err(|e| ProxyError::Transform(e.to_string()))?;

            for frame in decoder.into_frames() {
                let frame = frame.map_err(|e| ProxyError::InvalidImage(e.to_string()))?;
                let delay = frame.delay();
                let buffer = DynamicImage::ImageRgba8(frame.into_buffer());
                let transformed = self.transform_image(buffer, opt).to_rgba8();
                encoder
                    .encode_frame(Frame::from_parts(transformed, 0, 0, delay))
                    .map_err(|e| ProxyError::Transform(e.to_string()))?;
            }
        }
        Ok(out)
    }

    /// The decoded-image pipeline: crop, resize, rotate, flip.
    pub fn transform_image(&self, mut img: DynamicImage, opt: &Options) -> DynamicImage {
        if let Some((x, y, w, h)) = crop_params(&img, opt) {
            img = img.crop_imm(x, y, w, h);
        }

        if let Some((w, h)) = resize_params(&img, opt, self.max_scale_up) {
            if opt.fit && w > 0 && h > 0 {
                img = img.resize(w, h, self.filter);
            } else if w == 0 || h == 0 {
                let (img_w, img_h) = img.dimensions();
                if let Some((nw, nh)) = sized_to_aspect(w, h, img_w, img_h) {
                    img = img.resize_exact(nw, nh, self.filter);
                }
            } else {
                img = img.resize_to_fill(w, h, self.filter);
            }
        }

        // rotation degrees are counter-clockwise
        match opt.rotate.rem_euclid(360) {
            90 => img = img.rotate270(),
            180 => img = img.rotate180(),
            270 => img = img.rotate90(),
            _ => {}
        }

        if opt.flip_vertical {
            img = img.flipv();
        }
        if opt.flip_horizontal {
            img = img.fliph();
        }

        img
    }
}

/// Decode only the image header to learn its dimensions, without allocating
/// pixel buffers.
pub fn decode_dimensions(data: &[u8]) -> Result<(u32, u32)> {
    ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| ProxyError::InvalidImage(e.to_string()))?
        .into_dimensions()
        .map_err(|e| ProxyError::InvalidImage(e.to_string()))
}

/// The format the transformed image is encoded in: an explicit override
/// wins; TIFF and WebP fall back to JPEG; everything else keeps its source
/// format. `None` means the input format has no supported encoding.
fn output_format(input: ImageFormat, opt: &Options) -> Option<OutputFormat> {
    if let Some(format) = opt.format {
        return Some(format);
    }
    match input {
        ImageFormat::Png => Some(OutputFormat::Png),
        ImageFormat::Gif => Some(OutputFormat::Gif),
        ImageFormat::Jpeg => Some(OutputFormat::Jpeg),
        ImageFormat::Tiff | ImageFormat::WebP => Some(OutputFormat::Jpeg),
        _ => None,
    }
}

/// Whether transforming with `opt` changes the encoded format of `data`.
/// The fetch layer drops the upstream Content-Type header when it does.
pub fn changes_format(data: &[u8], opt: &Options) -> bool {
    match image::guess_format(data) {
        Ok(input) => match output_format(input, opt) {
            Some(output) => !matches!(
                (input, output),
                (ImageFormat::Jpeg, OutputFormat::Jpeg)
                    | (ImageFormat::Png, OutputFormat::Png)
                    | (ImageFormat::Gif, OutputFormat::Gif)
                    | (ImageFormat::Tiff, OutputFormat::Tiff)
            ),
            None => false,
        },
        Err(_) => false,
    }
}

fn encode(img: &DynamicImage, format: OutputFormat, quality: u8) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    match format {
        OutputFormat::Jpeg => {
            let quality = match quality {
                0 => DEFAULT_QUALITY,
                q => q.min(100),
            };
            // JPEG has no alpha channel
            let rgb = img.to_rgb8();
            let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
            encoder
                .encode_image(&rgb)
                .map_err(|e| ProxyError::Transform(e.to_string()))?;
        }
        OutputFormat::Png => {
            img.write_to(&mut out, ImageFormat::Png)
                .map_err(|e| ProxyError::Transform(e.to_string()))?;
        }
        OutputFormat::Gif => {
            img.write_to(&mut out, ImageFormat::Gif)
                .map_err(|e| ProxyError::Transform(e.to_string()))?;
        }
        OutputFormat::Tiff => {
            img.write_to(&mut out, ImageFormat::Tiff)
                .map_err(|e| ProxyError::Transform(e.to_string()))?;
        }
    }
    Ok(out.into_inner())
}

/// Read the EXIF orientation tag, looking at no more than `MAX_EXIF_SIZE`
/// bytes of input. Missing or unreadable metadata means "normal".
fn read_exif_orientation(data: &[u8]) -> u32 {
    let slice = &data[..data.len().min(MAX_EXIF_SIZE)];
    let mut cursor = Cursor::new(slice);
    let reader = match exif::Reader::new().read_from_container(&mut cursor) {
        Ok(reader) => reader,
        Err(_) => return 1,
    };

    reader
        .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|field| field.value.get_uint(0))
        .unwrap_or(1)
}

/// Apply an EXIF orientation value (1-8) to a decoded image.
fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

/// Resolve a width/height option against an image dimension: fractions in
/// (0,1) scale the dimension, values >= 1 are absolute pixels, and anything
/// else is unset.
fn resolve_dimension(value: f64, dimension: u32) -> u32 {
    if value > 0.0 && value < 1.0 {
        (dimension as f64 * value) as u32
    } else if value < 0.0 {
        0
    } else {
        value as u32
    }
}

/// Determine the crop rectangle, if any. Zero crop dimensions span the whole
/// image; negative origins are measured from the right/bottom edge; the
/// rectangle is clamped to the image bounds and dropped entirely when it
/// covers the whole image.
fn crop_params(img: &DynamicImage, opt: &Options) -> Option<(u32, u32, u32, u32)> {
    if opt.crop_x == 0.0 && opt.crop_y == 0.0 && opt.crop_width == 0.0 && opt.crop_height == 0.0 {
        return None;
    }

    let (img_w, img_h) = img.dimensions();

    let w = match resolve_dimension(opt.crop_width, img_w) {
        0 => img_w,
        w => w.min(img_w),
    };
    let h = match resolve_dimension(opt.crop_height, img_h) {
        0 => img_h,
        h => h.min(img_h),
    };

    let x = if opt.crop_x < 0.0 {
        img_w.saturating_sub(resolve_dimension(-opt.crop_x, img_w))
    } else {
        resolve_dimension(opt.crop_x, img_w).min(img_w)
    };
    let y = if opt.crop_y < 0.0 {
        img_h.saturating_sub(resolve_dimension(-opt.crop_y, img_h))
    } else {
        resolve_dimension(opt.crop_y, img_h).min(img_h)
    };

    // clamp the far corner to the image bounds
    let w = w.min(img_w - x);
    let h = h.min(img_h - y);

    if x == 0 && y == 0 && w == img_w && h == img_h {
        return None;
    }
    Some((x, y, w, h))
}

/// Determine whether the image needs resizing and to what target. A `None`
/// means the requested size already matches the source (or nothing was
/// requested). Returned components may be zero, meaning "preserve aspect".
fn resize_params(img: &DynamicImage, opt: &Options, max_scale_up: f64) -> Option<(u32, u32)> {
    let (img_w, img_h) = img.dimensions();

    let mut w = resolve_dimension(opt.width, img_w);
    let mut h = resolve_dimension(opt.height, img_h);

    // never resize larger than the source unless explicitly allowed
    if !opt.scale_up {
        if w > img_w {
            debug!("requested width {w} clamped to source width {img_w}");
            w = img_w;
        }
        if h > img_h {
            debug!("requested height {h} clamped to source height {img_h}");
            h = img_h;
        }
    }

    let (final_w, final_h) = sized_to_aspect(w, h, img_w, img_h)?;

    // scale-up is bounded by pixel-count growth to protect memory
    if opt.scale_up {
        let source_pixels = (img_w as f64) * (img_h as f64);
        let new_pixels = (final_w as f64) * (final_h as f64);
        if source_pixels > 0.0 && new_pixels / source_pixels > max_scale_up {
            warn!(
                "scale-up ratio {:.1} exceeds limit {:.1}, keeping source dimensions",
                new_pixels / source_pixels,
                max_scale_up
            );
            w = img_w;
            h = img_h;
        }
    }

    if (w == img_w || w == 0) && (h == img_h || h == 0) {
        return None;
    }
    Some((w, h))
}

/// Fill in a zero dimension from the source aspect ratio. `None` when both
/// are zero (nothing to do) or the source is degenerate.
fn sized_to_aspect(new_w: u32, new_h: u32, org_w: u32, org_h: u32) -> Option<(u32, u32)> {
    if new_w > 0 && new_h > 0 {
        return Some((new_w, new_h));
    }
    if org_w == 0 || org_h == 0 {
        return Some((org_w, org_h));
    }
    if new_w == 0 && new_h == 0 {
        return None;
    }

    let aspect = org_w as f64 / org_h as f64;
    if new_w == 0 {
        Some(((aspect * new_h as f64) as u32, new_h))
    } else {
        Some((new_w, (new_w as f64 / aspect) as u32))
    }
}
