//! DICOM decoding for brain-CT instances.
//!
//! Turns raw DICOM bytes into a validated, min-max normalized 2-D image
//! plus the identifiers the pipeline needs downstream. Non-DICOM payloads
//! are rejected early with a distinct error per failure mode, so callers
//! can tell a JSON body from a truncated file from a missing codec.

use std::borrow::Cow;

use dicom_core::value::{PrimitiveValue, Value};
use dicom_core::Tag;
use dicom_ct_common::{has_dicm_magic, DecodedImage, DicomMetadata, ProcessingError, DICM_MIN_LEN};
use dicom_dictionary_std::{tags, StandardDataDictionary};
use dicom_object::{from_reader, DefaultDicomObject, FileDicomObject, FileMetaTableBuilder,
    InMemDicomObject};
use dicom_pixeldata::{ConvertOptions, PixelDecoder, VoiLutOption};
use dicom_transfer_syntax_registry::entries;
use ndarray::{s, Array2, Ix2};
use thiserror::Error;
use tracing::{debug, warn};

/// Largest payload parsed leniently without the DICM signature.
const MAX_UNSIGNED_PAYLOAD: usize = 10_000;

const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
const FALLBACK_SOP_INSTANCE: &str = "1.2.3.4.5";

/// Decode failure modes, one per rejection rule.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty input")]
    EmptyInput,

    #[error("received JSON metadata instead of binary DICOM data")]
    JsonPayload,

    #[error("missing DICM signature in {0}-byte payload; refusing to parse large non-DICOM data")]
    MissingSignature(usize),

    #[error("failed to parse DICOM data: {strict}; forced parsing also failed: {forced}")]
    Unparseable { strict: String, forced: String },

    #[error("object is metadata-only: no study instance UID present")]
    MetadataOnly,

    #[error("no pixel data element; this may be a metadata-only object")]
    MissingPixelData,

    #[error("cannot decode pixel data under transfer syntax {ts}: {message}")]
    UnsupportedTransferSyntax { ts: String, message: String },

    #[error("failed to decode pixel data: {0}")]
    PixelDecode(String),

    #[error("decoded pixel buffer is empty")]
    EmptyPixelData,
}

impl From<DecodeError> for ProcessingError {
    fn from(err: DecodeError) -> Self {
        ProcessingError::Decode(err.to_string())
    }
}

/// Result type for decode operations
pub type Result<T> = std::result::Result<T, DecodeError>;

/// Decode one DICOM payload into metadata plus a normalized 2-D image.
///
/// # Errors
///
/// Returns a [`DecodeError`] when the payload is empty, is JSON, is a large
/// blob without the DICM signature, fails both strict and forced parsing,
/// is metadata-only, or carries no decodable pixel data.
pub fn decode(bytes: &[u8]) -> Result<DecodedImage> {
    let object = parse_object(bytes)?;
    let metadata = extract_metadata(&object);
    if !metadata.has_study() {
        return Err(DecodeError::MetadataOnly);
    }
    let pixels = extract_pixels(&object)?;
    let pixels = normalize(&pixels);
    Ok(DecodedImage { metadata, pixels })
}

/// Parse bytes into a DICOM object, validating the payload first.
///
/// Strict Part-10 reading is attempted first; on failure the data set is
/// re-read in forced mode as bare Implicit VR Little Endian. The error of a
/// doubly-failed parse carries both failure messages.
pub fn parse_object(bytes: &[u8]) -> Result<DefaultDicomObject> {
    validate_payload(bytes)?;

    match from_reader(strip_preamble(bytes)) {
        Ok(object) => Ok(object),
        Err(strict) => {
            debug!("strict DICOM parse failed, retrying in forced mode: {strict}");
            read_forced(bytes).map_err(|forced| DecodeError::Unparseable {
                strict: strict.to_string(),
                forced,
            })
        }
    }
}

// `from_reader` expects the stream to start at the DICM magic code, not at
// the 128-byte Part-10 preamble.
fn strip_preamble(bytes: &[u8]) -> &[u8] {
    if bytes.len() >= DICM_MIN_LEN && &bytes[128..132] == b"DICM" {
        &bytes[128..]
    } else {
        bytes
    }
}

fn validate_payload(bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Err(DecodeError::EmptyInput);
    }
    if bytes.starts_with(b"{") || bytes.starts_with(b"[") {
        return Err(DecodeError::JsonPayload);
    }
    // Payloads up to this size are tried anyway: writers may omit the
    // preamble, and short headerless files are still worth a parse attempt.
    if bytes.len() > MAX_UNSIGNED_PAYLOAD && !has_dicm_magic(bytes) {
        return Err(DecodeError::MissingSignature(bytes.len()));
    }
    Ok(())
}

fn read_forced(bytes: &[u8]) -> std::result::Result<DefaultDicomObject, String> {
    // A Part-10 prefix would otherwise be consumed as data set bytes.
    let data = if bytes.len() >= DICM_MIN_LEN && &bytes[128..132] == b"DICM" {
        &bytes[DICM_MIN_LEN..]
    } else {
        bytes
    };

    let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let dataset = InMemDicomObject::read_dataset_with_ts(data, &ts).map_err(|e| e.to_string())?;

    let sop_class = dataset
        .element(tags::SOP_CLASS_UID)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map_or_else(|| CT_IMAGE_STORAGE.to_string(), trim_uid);
    let sop_instance = dataset
        .element(tags::SOP_INSTANCE_UID)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map_or_else(|| FALLBACK_SOP_INSTANCE.to_string(), trim_uid);

    let meta = FileMetaTableBuilder::new()
        .transfer_syntax(IMPLICIT_VR_LE)
        .media_storage_sop_class_uid(sop_class)
        .media_storage_sop_instance_uid(sop_instance)
        .build()
        .map_err(|e| e.to_string())?;

    let mut object = FileDicomObject::new_empty_with_dict_and_meta(StandardDataDictionary, meta);
    for element in dataset {
        object.put(element);
    }
    Ok(object)
}

fn trim_uid(value: Cow<'_, str>) -> String {
    value.trim_end_matches('\0').to_string()
}

/// Extract identifiers and acquisition details. Missing tags become `None`.
#[must_use]
pub fn extract_metadata(object: &DefaultDicomObject) -> DicomMetadata {
    DicomMetadata {
        study_instance_uid: tag_str(object, tags::STUDY_INSTANCE_UID),
        series_instance_uid: tag_str(object, tags::SERIES_INSTANCE_UID),
        sop_instance_uid: tag_str(object, tags::SOP_INSTANCE_UID),
        patient_id: tag_str(object, tags::PATIENT_ID),
        patient_name: tag_str(object, tags::PATIENT_NAME),
        study_date: tag_str(object, tags::STUDY_DATE),
        modality: tag_str(object, tags::MODALITY),
        slice_thickness: tag_f64(object, tags::SLICE_THICKNESS),
        pixel_spacing: tag_f64(object, tags::PIXEL_SPACING),
        rows: tag_u32(object, tags::ROWS),
        columns: tag_u32(object, tags::COLUMNS),
    }
}

/// Extract the first frame's first sample as an `f32` array.
///
/// # Errors
///
/// Fails when the pixel data element is absent, cannot be decoded under the
/// object's transfer syntax, or decodes to an empty buffer.
pub fn extract_pixels(object: &DefaultDicomObject) -> Result<Array2<f32>> {
    if object.element(tags::PIXEL_DATA).is_err() {
        return Err(DecodeError::MissingPixelData);
    }

    let decoded = object
        .decode_pixel_data()
        .map_err(|e| classify_pixel_error(object, &e.to_string()))?;

    let options = ConvertOptions::new().with_voi_lut(VoiLutOption::First);
    let array = decoded
        .to_ndarray_with_options::<f32>(&options)
        .map_err(|e| DecodeError::PixelDecode(e.to_string()))?;

    // Converted layout is (frames, rows, columns, samples).
    let frame = array
        .slice_move(s![0, .., .., 0])
        .into_dimensionality::<Ix2>()
        .map_err(|e| DecodeError::PixelDecode(e.to_string()))?;

    if frame.is_empty() {
        return Err(DecodeError::EmptyPixelData);
    }
    Ok(frame)
}

fn classify_pixel_error(object: &DefaultDicomObject, message: &str) -> DecodeError {
    if message.to_lowercase().contains("transfer syntax") {
        let ts = object.meta().transfer_syntax().trim_end_matches('\0').to_string();
        warn!("pixel decoding unavailable for transfer syntax {ts}");
        DecodeError::UnsupportedTransferSyntax {
            ts,
            message: message.to_string(),
        }
    } else {
        DecodeError::PixelDecode(message.to_string())
    }
}

/// Min-max scale an image into [0, 1].
///
/// A constant image maps to all zeros; an empty input is returned unchanged.
#[must_use]
pub fn normalize(image: &Array2<f32>) -> Array2<f32> {
    if image.is_empty() {
        return image.clone();
    }
    let min = image.iter().copied().fold(f32::INFINITY, f32::min);
    let max = image.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max <= min {
        return Array2::zeros(image.raw_dim());
    }
    image.mapv(|v| (v - min) / (max - min))
}

fn tag_str(object: &DefaultDicomObject, tag: Tag) -> Option<String> {
    let element = object.element(tag).ok()?;
    let raw = match element.value() {
        Value::Primitive(PrimitiveValue::Str(s)) => s.to_string(),
        Value::Primitive(PrimitiveValue::Strs(strings)) => strings.first()?.to_string(),
        _ => return None,
    };
    let trimmed = raw
        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn tag_f64(object: &DefaultDicomObject, tag: Tag) -> Option<f64> {
    let element = object.element(tag).ok()?;
    match element.value() {
        Value::Primitive(PrimitiveValue::F64(values)) => values.first().copied(),
        Value::Primitive(PrimitiveValue::F32(values)) => values.first().map(|&v| f64::from(v)),
        Value::Primitive(PrimitiveValue::Str(s)) => parse_decimal(s.as_ref()),
        Value::Primitive(PrimitiveValue::Strs(strings)) => {
            strings.first().and_then(|s| parse_decimal(s))
        }
        _ => None,
    }
}

fn parse_decimal(raw: &str) -> Option<f64> {
    raw.trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .parse()
        .ok()
}

fn tag_u32(object: &DefaultDicomObject, tag: Tag) -> Option<u32> {
    let element = object.element(tag).ok()?;
    match element.value() {
        Value::Primitive(PrimitiveValue::U16(values)) => values.first().map(|&v| u32::from(v)),
        Value::Primitive(PrimitiveValue::U32(values)) => values.first().copied(),
        Value::Primitive(PrimitiveValue::I32(values)) => {
            values.first().and_then(|&v| u32::try_from(v).ok())
        }
        _ => None,
    }
}
