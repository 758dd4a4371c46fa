//! Shared fixtures for the integration suites
//!
//! Builds small synthetic CT instances in memory so the suites can drive the
//! full pipeline without checked-in DICOM files.

use dicom_core::value::PrimitiveValue;
use dicom_core::{DataElement, VR};
use dicom_ct_abnormality_detection::{AbnormalityDetector, DetectionConfig};
use dicom_ct_orchestrator::{PipelineConfig, ReportPipeline};
use dicom_ct_report::{ReportComposer, ReportConfig};
use dicom_dictionary_std::{tags, StandardDataDictionary};
use dicom_object::{FileDicomObject, FileMetaTableBuilder, InMemDicomObject};

const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";

/// 8x8 gradient pixels, spread so normalization has a real value range.
pub fn gradient_pixels() -> Vec<u16> {
    (0..64).map(|v| v * 16).collect()
}

/// Build a complete explicit-VR little-endian CT instance.
pub fn ct_slice(study_uid: &str, sop_uid: &str, pixels: &[u16]) -> Vec<u8> {
    assert_eq!(pixels.len(), 64, "fixture slices are 8x8");

    let mut dataset = InMemDicomObject::new_empty();
    dataset.put(DataElement::new(
        tags::SOP_CLASS_UID,
        VR::UI,
        PrimitiveValue::from(CT_IMAGE_STORAGE),
    ));
    dataset.put(DataElement::new(
        tags::SOP_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from(sop_uid),
    ));
    dataset.put(DataElement::new(
        tags::STUDY_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from(study_uid),
    ));
    dataset.put(DataElement::new(
        tags::SERIES_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from("1.2.826.0.1.3680043.8.498.2"),
    ));
    dataset.put(DataElement::new(
        tags::PATIENT_ID,
        VR::LO,
        PrimitiveValue::from("PAT001"),
    ));
    dataset.put(DataElement::new(
        tags::PATIENT_NAME,
        VR::PN,
        PrimitiveValue::from("DOE^JANE"),
    ));
    dataset.put(DataElement::new(
        tags::MODALITY,
        VR::CS,
        PrimitiveValue::from("CT"),
    ));
    dataset.put(DataElement::new(
        tags::ROWS,
        VR::US,
        PrimitiveValue::from(8_u16),
    ));
    dataset.put(DataElement::new(
        tags::COLUMNS,
        VR::US,
        PrimitiveValue::from(8_u16),
    ));
    dataset.put(DataElement::new(
        tags::BITS_ALLOCATED,
        VR::US,
        PrimitiveValue::from(16_u16),
    ));
    dataset.put(DataElement::new(
        tags::BITS_STORED,
        VR::US,
        PrimitiveValue::from(16_u16),
    ));
    dataset.put(DataElement::new(
        tags::HIGH_BIT,
        VR::US,
        PrimitiveValue::from(15_u16),
    ));
    dataset.put(DataElement::new(
        tags::PIXEL_REPRESENTATION,
        VR::US,
        PrimitiveValue::from(0_u16),
    ));
    dataset.put(DataElement::new(
        tags::SAMPLES_PER_PIXEL,
        VR::US,
        PrimitiveValue::from(1_u16),
    ));
    dataset.put(DataElement::new(
        tags::PHOTOMETRIC_INTERPRETATION,
        VR::CS,
        PrimitiveValue::from("MONOCHROME2"),
    ));

    let mut raw = Vec::with_capacity(pixels.len() * 2);
    for value in pixels {
        raw.extend_from_slice(&value.to_le_bytes());
    }
    dataset.put(DataElement::new(
        tags::PIXEL_DATA,
        VR::OW,
        PrimitiveValue::from(raw),
    ));

    let meta = FileMetaTableBuilder::new()
        .transfer_syntax(EXPLICIT_VR_LE)
        .media_storage_sop_class_uid(CT_IMAGE_STORAGE)
        .media_storage_sop_instance_uid(sop_uid)
        .build()
        .unwrap();

    let mut object = FileDicomObject::new_empty_with_dict_and_meta(StandardDataDictionary, meta);
    for element in dataset {
        object.put(element);
    }

    let mut bytes = Vec::new();
    object.write_all(&mut bytes).unwrap();
    bytes
}

/// Pipeline with the synthetic detector and an unreachable generation
/// backend, so composition always exercises the deterministic fallback.
pub fn offline_pipeline(config: PipelineConfig) -> ReportPipeline {
    let detector = AbnormalityDetector::mock(DetectionConfig::default());
    let composer = ReportComposer::new(ReportConfig {
        base_url: "http://127.0.0.1:9".to_string(),
        ..ReportConfig::default()
    });
    ReportPipeline::new(detector, composer, config)
}
