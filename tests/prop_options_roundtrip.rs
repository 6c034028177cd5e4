// Property: the canonical string form of Options is lossless. Every option
// set a client can express survives a String -> parse round trip, and the
// string form is what partitions cache keys.

use proptest::prelude::*;
use refract::{ImageRequest, Options, OutputFormat};
use url::Url;

fn dimension() -> impl Strategy<Value = f64> {
    prop_oneof![
        Just(0.0),
        (1u32..4000).prop_map(|v| v as f64),
        (1u32..100).prop_map(|v| v as f64 / 100.0),
    ]
}

fn crop_offset() -> impl Strategy<Value = f64> {
    (-2000i32..2000).prop_map(|v| v as f64)
}

fn signature() -> impl Strategy<Value = String> {
    // URL-safe base64 shaped, fixed length like real HMAC-SHA256 signatures
    proptest::string::string_regex("[A-Za-z0-9_-]{43}=?").unwrap()
}

fn format() -> impl Strategy<Value = Option<OutputFormat>> {
    prop_oneof![
        Just(None),
        Just(Some(OutputFormat::Jpeg)),
        Just(Some(OutputFormat::Png)),
        Just(Some(OutputFormat::Gif)),
        Just(Some(OutputFormat::Tiff)),
    ]
}

prop_compose! {
    fn geometry()(
        width in dimension(),
        height in dimension(),
        fit in any::<bool>(),
        rotate in prop_oneof![Just(0), Just(90), Just(180), Just(270), Just(-90), Just(45)],
        flip_vertical in any::<bool>(),
        flip_horizontal in any::<bool>(),
        crop_width in dimension(),
        crop_height in dimension(),
        crop_x in crop_offset(),
        crop_y in crop_offset(),
    ) -> Options {
        Options {
            width,
            height,
            fit,
            rotate,
            flip_vertical,
            flip_horizontal,
            crop_width,
            crop_height,
            crop_x,
            crop_y,
            ..Default::default()
        }
    }
}

prop_compose! {
    fn options()(
        base in geometry(),
        quality in 0u8..=100,
        signature in prop_oneof![Just(String::new()), signature()],
        scale_up in any::<bool>(),
        format in format(),
    ) -> Options {
        Options {
            quality,
            signature,
            scale_up,
            format,
            ..base
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// ParseOptions(o.String()) == o for every canonical o.
    #[test]
    fn prop_string_round_trip(opt in options()) {
        let rendered = opt.to_string();
        let parsed = Options::parse(&rendered);
        prop_assert_eq!(parsed, opt, "rendered form was {}", rendered);
    }

    /// Two option sets produce distinct cache keys exactly when their
    /// canonical strings differ.
    #[test]
    fn prop_fragment_partitions_cache_keys(a in options(), b in options()) {
        let url = Url::parse("http://example.com/image.jpg").unwrap();
        let req_a = ImageRequest { url: url.clone(), options: a.clone() };
        let req_b = ImageRequest { url, options: b.clone() };

        prop_assert_eq!(
            a.to_string() == b.to_string(),
            req_a.to_string() == req_b.to_string()
        );
    }

    /// Parsing never panics on arbitrary input.
    #[test]
    fn prop_parse_total(s in ".{0,64}") {
        let _ = Options::parse(&s);
    }

    /// The transform predicate is determined by the pixel-affecting fields
    /// alone: quality and signature never make a request a transform.
    #[test]
    fn prop_transform_ignores_quality_and_signature(
        quality in 0u8..=100,
        signature in prop_oneof![Just(String::new()), signature()],
    ) {
        let opt = Options {
            quality,
            signature,
            ..Default::default()
        };
        prop_assert!(!opt.transform());
    }
}
