use chrono::NaiveDateTime;
use exif::{Field, In, Tag, Value};
use std::{fs::File, io::BufReader, path::Path};
use thiserror::Error;

const SHORT_TEXT_LEN: usize = 30;
const EXIF_DATE_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

#[derive(Error, Debug)]
pub enum ExifError {
    #[error("Failed to open image: {0}")]
    Open(#[from] std::io::Error),
    #[error("Failed to parse EXIF data: {0}")]
    Parse(#[from] exif::Error),
}

/// Camera and encoding attributes read from an image's EXIF block. Every field
/// is optional since cameras and editors write wildly different subsets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageMetadata {
    pub camera_vendor: Option<String>,
    pub camera_model: Option<String>,
    pub taken: Option<NaiveDateTime>,
    pub compression: Option<String>,
    pub x_resolution: Option<f64>,
    pub y_resolution: Option<f64>,
    pub resolution_unit: Option<i16>,
    pub exposure_time: Option<f64>,
    pub exposure_program: Option<i16>,
    pub exif_version: Option<Vec<u8>>,
    pub component_configuration: Option<Vec<u8>>,
    pub exposure_bias: Option<f64>,
    pub max_aperture_value: Option<f64>,
    pub aperture_value: Option<f64>,
    pub flash: Option<i16>,
    pub color_space: Option<i16>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub orientation: Option<String>,
}

impl ImageMetadata {
    pub fn read_from_path(path: &Path) -> Result<Self, ExifError> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let exif = exif::Reader::new().read_from_container(&mut reader)?;

        Ok(Self::from_fields(exif.fields()))
    }

    /// Thumbnail values are applied first so that the primary image overrides them.
    pub fn from_fields<'a>(fields: impl IntoIterator<Item = &'a Field>) -> Self {
        let mut metadata = ImageMetadata::default();

        let (primary, thumbnail): (Vec<&Field>, Vec<&Field>) = fields
            .into_iter()
            .partition(|f| f.ifd_num == In::PRIMARY);

        for field in thumbnail.into_iter().chain(primary) {
            metadata.apply(field);
        }

        metadata
    }

    fn apply(&mut self, field: &Field) {
        let value = &field.value;
        match field.tag {
            Tag::Make => set(&mut self.camera_vendor, short_text(value)),
            Tag::Model => set(&mut self.camera_model, short_text(value)),
            Tag::DateTimeOriginal => set(&mut self.taken, date_time(value)),
            Tag::Compression => set(&mut self.compression, display_text(field)),
            Tag::XResolution => set(&mut self.x_resolution, float(value)),
            Tag::YResolution => set(&mut self.y_resolution, float(value)),
            Tag::ResolutionUnit => set(&mut self.resolution_unit, small_int(value)),
            Tag::ExposureTime => set(&mut self.exposure_time, float(value)),
            Tag::ExposureProgram => set(&mut self.exposure_program, small_int(value)),
            Tag::ExifVersion => set(&mut self.exif_version, raw_bytes(value)),
            Tag::ComponentsConfiguration => {
                set(&mut self.component_configuration, raw_bytes(value))
            }
            Tag::ExposureBiasValue => set(&mut self.exposure_bias, float(value)),
            Tag::MaxApertureValue => set(&mut self.max_aperture_value, float(value)),
            Tag::ApertureValue => set(&mut self.aperture_value, float(value)),
            Tag::Flash => set(&mut self.flash, small_int(value)),
            Tag::ColorSpace => set(&mut self.color_space, small_int(value)),
            Tag::PixelXDimension | Tag::ImageWidth => set(&mut self.width, int(value)),
            Tag::PixelYDimension | Tag::ImageLength => set(&mut self.height, int(value)),
            Tag::Orientation => set(&mut self.orientation, code(value)),
            _ => {}
        }
    }
}

fn set<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn ascii(value: &Value) -> Option<String> {
    match value {
        Value::Ascii(parts) => parts
            .first()
            .map(|bytes| String::from_utf8_lossy(bytes).trim_end_matches('\0').trim().to_string())
            .filter(|s| !s.is_empty()),
        _ => None,
    }
}

fn short_text(value: &Value) -> Option<String> {
    ascii(value).map(|s| clamp(&s, SHORT_TEXT_LEN))
}

fn display_text(field: &Field) -> Option<String> {
    let text = field.display_value().to_string();
    if text.is_empty() {
        None
    } else {
        Some(clamp(&text, SHORT_TEXT_LEN))
    }
}

// numeric EXIF code
fn code(value: &Value) -> Option<String> {
    value.get_uint(0).map(|v| v.to_string())
}

fn date_time(value: &Value) -> Option<NaiveDateTime> {
    ascii(value).and_then(|s| NaiveDateTime::parse_from_str(&s, EXIF_DATE_FORMAT).ok())
}

fn float(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Rational(v) => v.first().map(|r| r.to_f64()),
        Value::SRational(v) => v.first().map(|r| r.to_f64()),
        Value::Float(v) => v.first().map(|f| *f as f64),
        Value::Double(v) => v.first().copied(),
        other => other.get_uint(0).map(f64::from),
    };
    // 0/0 rationals show up in the wild
    number.filter(|f| f.is_finite())
}

fn int(value: &Value) -> Option<i32> {
    value.get_uint(0).and_then(|v| i32::try_from(v).ok())
}

fn small_int(value: &Value) -> Option<i16> {
    value.get_uint(0).and_then(|v| i16::try_from(v).ok())
}

fn raw_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::Undefined(bytes, _) | Value::Byte(bytes) => Some(bytes.clone()),
        _ => None,
    }
}

pub(crate) fn clamp(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use exif::Rational;

    fn field(tag: Tag, ifd_num: In, value: Value) -> Field {
        Field {
            tag,
            ifd_num,
            value,
        }
    }

    #[test]
    fn test_maps_primary_fields() {
        let fields = vec![
            field(Tag::Make, In::PRIMARY, Value::Ascii(vec![b"Canon".to_vec()])),
            field(
                Tag::Model,
                In::PRIMARY,
                Value::Ascii(vec![b"Canon EOS 5D Mark IV\0".to_vec()]),
            ),
            field(
                Tag::DateTimeOriginal,
                In::PRIMARY,
                Value::Ascii(vec![b"2019:05:04 13:37:00".to_vec()]),
            ),
            field(
                Tag::ExposureTime,
                In::PRIMARY,
                Value::Rational(vec![Rational { num: 1, denom: 250 }]),
            ),
            field(Tag::Flash, In::PRIMARY, Value::Short(vec![16])),
            field(Tag::PixelXDimension, In::PRIMARY, Value::Long(vec![6720])),
            field(Tag::PixelYDimension, In::PRIMARY, Value::Short(vec![4480])),
            field(
                Tag::ExifVersion,
                In::PRIMARY,
                Value::Undefined(b"0231".to_vec(), 0),
            ),
        ];

        let metadata = ImageMetadata::from_fields(fields.iter());

        assert_eq!(metadata.camera_vendor.as_deref(), Some("Canon"));
        assert_eq!(metadata.camera_model.as_deref(), Some("Canon EOS 5D Mark IV"));
        assert_eq!(
            metadata.taken.map(|t| t.to_string()).as_deref(),
            Some("2019-05-04 13:37:00")
        );
        assert_eq!(metadata.exposure_time, Some(0.004));
        assert_eq!(metadata.flash, Some(16));
        assert_eq!(metadata.width, Some(6720));
        assert_eq!(metadata.height, Some(4480));
        assert_eq!(metadata.exif_version.as_deref(), Some(&b"0231"[..]));
        assert_eq!(metadata.orientation, None);
    }

    #[test]
    fn test_primary_wins_over_thumbnail() {
        let fields = vec![
            field(
                Tag::XResolution,
                In::PRIMARY,
                Value::Rational(vec![Rational { num: 300, denom: 1 }]),
            ),
            field(
                Tag::XResolution,
                In::THUMBNAIL,
                Value::Rational(vec![Rational { num: 72, denom: 1 }]),
            ),
            field(Tag::ResolutionUnit, In::THUMBNAIL, Value::Short(vec![2])),
        ];

        let metadata = ImageMetadata::from_fields(fields.iter());

        assert_eq!(metadata.x_resolution, Some(300.0));
        assert_eq!(metadata.resolution_unit, Some(2));
    }

    #[test]
    fn test_text_is_clamped_and_bad_dates_skipped() {
        let long_vendor = "A".repeat(64);
        let fields = vec![
            field(
                Tag::Make,
                In::PRIMARY,
                Value::Ascii(vec![long_vendor.into_bytes()]),
            ),
            field(
                Tag::DateTimeOriginal,
                In::PRIMARY,
                Value::Ascii(vec![b"    :  :     :  :  ".to_vec()]),
            ),
        ];

        let metadata = ImageMetadata::from_fields(fields.iter());

        assert_eq!(metadata.camera_vendor.map(|v| v.len()), Some(SHORT_TEXT_LEN));
        assert_eq!(metadata.taken, None);
    }

    #[test]
    fn test_orientation_keeps_the_code() {
        let orientation = |code: u16| {
            let fields = vec![field(Tag::Orientation, In::PRIMARY, Value::Short(vec![code]))];
            ImageMetadata::from_fields(fields.iter()).orientation
        };

        assert_eq!(orientation(5), Some("5".to_string()));
        assert_eq!(orientation(8), Some("8".to_string()));
        assert_ne!(orientation(6), orientation(7));
    }

    #[test]
    fn test_non_image_file_is_an_error() {
        let path = std::env::temp_dir().join(format!("not-an-image-{}.jpg", uuid::Uuid::new_v4()));
        std::fs::write(&path, b"definitely not a jpeg").unwrap();

        let result = ImageMetadata::read_from_path(&path);

        assert!(matches!(result, Err(ExifError::Parse(_))));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = ImageMetadata::read_from_path(Path::new("/nonexistent/intake/image.jpg"));
        assert!(matches!(result, Err(ExifError::Open(_))));
    }
}
