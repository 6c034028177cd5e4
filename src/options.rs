//! Transformation option grammar
//!
//! Options travel in the first path segment of a proxy request as a compact
//! comma-separated list (`100x200,r90,q80`), and ride in the URL fragment of
//! the remote URL so that every distinct option set gets its own cache key.

use std::fmt;

const OPT_FIT: &str = "fit";
const OPT_FLIP_VERTICAL: &str = "fv";
const OPT_FLIP_HORIZONTAL: &str = "fh";
const OPT_SCALE_UP: &str = "scaleUp";
const OPT_ROTATE_PREFIX: &str = "r";
const OPT_QUALITY_PREFIX: &str = "q";
const OPT_SIGNATURE_PREFIX: &str = "s";
const OPT_CROP_WIDTH_PREFIX: &str = "cw";
const OPT_CROP_HEIGHT_PREFIX: &str = "ch";
const OPT_CROP_X_PREFIX: &str = "cx";
const OPT_CROP_Y_PREFIX: &str = "cy";
const OPT_SIZE_DELIMITER: char = 'x';

/// Output format override for the transformed image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Jpeg,
    Png,
    Gif,
    Tiff,
}

impl OutputFormat {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "jpeg" => Some(OutputFormat::Jpeg),
            "png" => Some(OutputFormat::Png),
            "gif" => Some(OutputFormat::Gif),
            "tiff" => Some(OutputFormat::Tiff),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Png => "png",
            OutputFormat::Gif => "gif",
            OutputFormat::Tiff => "tiff",
        }
    }
}

/// Transformations to be performed on the requested image.
///
/// Width and height values in the open interval (0,1) are fractions of the
/// source dimension; values >= 1 are exact pixels; values <= 0 mean unset.
/// The same rule applies to the crop fields, where negative `crop_x` /
/// `crop_y` are measured from the right / bottom edge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Options {
    pub width: f64,
    pub height: f64,

    /// Resize to fit within the requested box, preserving aspect ratio and
    /// never cropping.
    pub fit: bool,

    /// Rotate counter-clockwise by the given degrees. Only 90, 180 and 270
    /// take effect after normalization.
    pub rotate: i32,

    pub flip_vertical: bool,
    pub flip_horizontal: bool,

    /// Quality of the encoded output, 1-100. Zero selects the default (95).
    pub quality: u8,

    /// HMAC signature for signed requests.
    pub signature: String,

    /// Allow the image to scale beyond its original dimensions, subject to
    /// the proxy-wide max scale-up ratio.
    pub scale_up: bool,

    pub crop_width: f64,
    pub crop_height: f64,
    pub crop_x: f64,
    pub crop_y: f64,

    /// Output format override. None keeps the source format (with the
    /// TIFF/WebP-to-JPEG fallback applied by the transform engine).
    pub format: Option<OutputFormat>,
}

impl Options {
    /// Parse a comma-separated option list.
    ///
    /// Empty tokens are ignored, unparseable numbers default to zero, and
    /// the last occurrence of a duplicated key wins.
    pub fn parse(s: &str) -> Options {
        let mut options = Options::default();

        for opt in s.split(',') {
            if opt.is_empty() {
                continue;
            }
            if opt == OPT_FIT {
                options.fit = true;
            } else if opt == OPT_FLIP_VERTICAL {
                options.flip_vertical = true;
            } else if opt == OPT_FLIP_HORIZONTAL {
                options.flip_horizontal = true;
            } else if opt == OPT_SCALE_UP {
                options.scale_up = true;
            } else if let Some(format) = OutputFormat::from_token(opt) {
                options.format = Some(format);
            } else if let Some(v) = opt.strip_prefix(OPT_CROP_WIDTH_PREFIX) {
                options.crop_width = v.parse().unwrap_or(0.0);
            } else if let Some(v) = opt.strip_prefix(OPT_CROP_HEIGHT_PREFIX) {
                options.crop_height = v.parse().unwrap_or(0.0);
            } else if let Some(v) = opt.strip_prefix(OPT_CROP_X_PREFIX) {
                options.crop_x = v.parse().unwrap_or(0.0);
            } else if let Some(v) = opt.strip_prefix(OPT_CROP_Y_PREFIX) {
                options.crop_y = v.parse().unwrap_or(0.0);
            } else if let Some(v) = opt.strip_prefix(OPT_ROTATE_PREFIX) {
                options.rotate = v.parse().unwrap_or(0);
            } else if let Some(v) = opt.strip_prefix(OPT_QUALITY_PREFIX) {
                options.quality = v.parse().unwrap_or(0);
            } else if let Some(v) = opt.strip_prefix(OPT_SIGNATURE_PREFIX) {
                options.signature = v.to_string();
            } else if let Some((w, h)) = opt.split_once(OPT_SIZE_DELIMITER) {
                if !w.is_empty() {
                    options.width = w.parse().unwrap_or(0.0);
                }
                if !h.is_empty() {
                    options.height = h.parse().unwrap_or(0.0);
                }
            } else if let Ok(size) = opt.parse::<f64>() {
                options.width = size;
                options.height = size;
            }
        }

        options
    }

    /// Whether these options request any pixel-level transformation.
    ///
    /// Signature and quality are not transforms on their own, and a crop
    /// only counts once both its dimensions are set. When this returns false
    /// the transform engine passes bytes through unchanged.
    pub fn transform(&self) -> bool {
        self.width != 0.0
            || self.height != 0.0
            || self.rotate != 0
            || self.flip_horizontal
            || self.flip_vertical
            || (self.crop_width != 0.0 && self.crop_height != 0.0)
    }
}

impl fmt::Display for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.width, OPT_SIZE_DELIMITER, self.height)?;
        if self.fit {
            write!(f, ",{OPT_FIT}")?;
        }
        if self.rotate != 0 {
            write!(f, ",{}{}", OPT_ROTATE_PREFIX, self.rotate)?;
        }
        if self.flip_vertical {
            write!(f, ",{OPT_FLIP_VERTICAL}")?;
        }
        if self.flip_horizontal {
            write!(f, ",{OPT_FLIP_HORIZONTAL}")?;
        }
        if self.quality != 0 {
            write!(f, ",{}{}", OPT_QUALITY_PREFIX, self.quality)?;
        }
        if !self.signature.is_empty() {
            write!(f, ",{}{}", OPT_SIGNATURE_PREFIX, self.signature)?;
        }
        if self.scale_up {
            write!(f, ",{OPT_SCALE_UP}")?;
        }
        if self.crop_width != 0.0 {
            write!(f, ",{}{}", OPT_CROP_WIDTH_PREFIX, self.crop_width)?;
        }
        if self.crop_height != 0.0 {
            write!(f, ",{}{}", OPT_CROP_HEIGHT_PREFIX, self.crop_height)?;
        }
        if self.crop_x != 0.0 {
            write!(f, ",{}{}", OPT_CROP_X_PREFIX, self.crop_x)?;
        }
        if self.crop_y != 0.0 {
            write!(f, ",{}{}", OPT_CROP_Y_PREFIX, self.crop_y)?;
        }
        if let Some(format) = self.format {
            write!(f, ",{}", format.as_str())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty() {
        assert_eq!(Options::parse(""), Options::default());
        assert_eq!(Options::parse(",,,"), Options::default());
    }

    #[test]
    fn test_parse_flags() {
        let opt = Options::parse("fit,fv,fh,scaleUp");
        assert!(opt.fit);
        assert!(opt.flip_vertical);
        assert!(opt.flip_horizontal);
        assert!(opt.scale_up);
    }

    #[test]
    fn test_parse_sizes() {
        let opt = Options::parse("100x200");
        assert_eq!((opt.width, opt.height), (100.0, 200.0));

        let opt = Options::parse("0.15x");
        assert_eq!((opt.width, opt.height), (0.15, 0.0));

        let opt = Options::parse("x100");
        assert_eq!((opt.width, opt.height), (0.0, 100.0));

        // bare number applies to both dimensions
        let opt = Options::parse("100");
        assert_eq!((opt.width, opt.height), (100.0, 100.0));

        // unparseable numbers default to zero
        let opt = Options::parse("axb");
        assert_eq!((opt.width, opt.height), (0.0, 0.0));
    }

    #[test]
    fn test_parse_prefixed_values() {
        let opt = Options::parse("r90,q80,sABCD=");
        assert_eq!(opt.rotate, 90);
        assert_eq!(opt.quality, 80);
        assert_eq!(opt.signature, "ABCD=");
    }

    #[test]
    fn test_parse_crop() {
        let opt = Options::parse("cw100,ch200,cx10,cy20");
        assert_eq!(opt.crop_width, 100.0);
        assert_eq!(opt.crop_height, 200.0);
        assert_eq!(opt.crop_x, 10.0);
        assert_eq!(opt.crop_y, 20.0);

        // negative crop origins are measured from the far edge
        let opt = Options::parse("cx-10,cy-20");
        assert_eq!(opt.crop_x, -10.0);
        assert_eq!(opt.crop_y, -20.0);
    }

    #[test]
    fn test_parse_format() {
        assert_eq!(Options::parse("png").format, Some(OutputFormat::Png));
        assert_eq!(Options::parse("jpeg").format, Some(OutputFormat::Jpeg));
        assert_eq!(Options::parse("100x,tiff").format, Some(OutputFormat::Tiff));
        assert_eq!(Options::parse("100x").format, None);
    }

    #[test]
    fn test_last_writer_wins() {
        let opt = Options::parse("r90,r180");
        assert_eq!(opt.rotate, 180);

        let opt = Options::parse("100x100,200x200");
        assert_eq!((opt.width, opt.height), (200.0, 200.0));
    }

    #[test]
    fn test_transform_predicate() {
        assert!(!Options::default().transform());
        assert!(!Options::parse("q80").transform());
        assert!(!Options::parse("sABCD").transform());
        // crop only counts with both dimensions
        assert!(!Options::parse("cw100").transform());
        assert!(Options::parse("cw100,ch100").transform());
        assert!(Options::parse("100x").transform());
        assert!(Options::parse("r90").transform());
        assert!(Options::parse("fv").transform());
    }

    #[test]
    fn test_display_canonical() {
        assert_eq!(Options::default().to_string(), "0x0");
        let opt = Options::parse("100x200,fit,r90,fv,fh,q80,sXYZ,scaleUp");
        assert_eq!(opt.to_string(), "100x200,fit,r90,fv,fh,q80,sXYZ,scaleUp");
    }

    #[test]
    fn test_display_round_trip() {
        let cases = [
            "0x0",
            "100x200",
            "0.15x0",
            "0x0,fit",
            "100x200,fit,r90,fv,fh,q80,sXYZ,scaleUp,cw100,ch200,cx-10,cy20",
            "50x50,png",
        ];
        for s in cases {
            let opt = Options::parse(s);
            assert_eq!(Options::parse(&opt.to_string()), opt, "case {s}");
        }
    }
}
