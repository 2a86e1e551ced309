use std::collections::BTreeSet;

use assert_matches::assert_matches;

use study_organizer::domain::{
    DatasetDescriptor, DatasetId, DatasetKind, Revision, StudyId, StudyPlan,
};
use study_organizer::error::StudyError;

fn rev(ch: char) -> Revision {
    ch.to_string().repeat(40).parse().unwrap()
}

#[test]
fn parse_dataset_id_rejects_path_like_values() {
    assert_matches!(
        "../ds1".parse::<DatasetId>(),
        Err(StudyError::InvalidDatasetId(_))
    );
    assert_matches!(
        "ds 1".parse::<DatasetId>(),
        Err(StudyError::InvalidDatasetId(_))
    );
    assert_eq!("ds000001".parse::<DatasetId>().unwrap().as_str(), "ds000001");
}

#[test]
fn revisions_must_be_full_object_ids() {
    let sha256 = "c".repeat(64);
    assert_eq!(sha256.parse::<Revision>().unwrap().short(), "cccccccc");
    assert_matches!(
        "abc1234".parse::<Revision>(),
        Err(StudyError::InvalidRevision(_))
    );
    assert_matches!("HEAD".parse::<Revision>(), Err(StudyError::InvalidRevision(_)));
    assert_eq!(
        "A".repeat(40).parse::<Revision>().unwrap().as_str(),
        "a".repeat(40)
    );
}

#[test]
fn study_id_from_members() {
    let members = ["dsC", "dsA", "dsB"]
        .iter()
        .map(|id| id.parse::<DatasetId>().unwrap())
        .collect::<BTreeSet<_>>();
    let study = StudyId::for_members(&members);
    assert_eq!(study.as_str(), "study-dsA+dsB+dsC");
    assert_eq!(study, "study-dsA+dsB+dsC".parse().unwrap());
    assert_matches!(
        "dsA+dsB".parse::<StudyId>(),
        Err(StudyError::InvalidStudyId(_))
    );
    assert_matches!(
        "study-dsA++dsB".parse::<StudyId>(),
        Err(StudyError::InvalidStudyId(_))
    );
}

#[test]
fn descriptor_json_ignores_unknown_fields() {
    let json = format!(
        r#"{{
            "id": "ds000001-fmriprep",
            "source_url": "https://github.com/OpenNeuroDerivatives/ds000001-fmriprep",
            "revision": "{}",
            "kind": "derivative",
            "declared_source_ids": ["ds000001"],
            "tool_name": "fmriprep",
            "tool_version": "21.0.1",
            "size_bytes": 12345
        }}"#,
        "e".repeat(40)
    );
    let descriptor: DatasetDescriptor = serde_json::from_str(&json).unwrap();
    assert_eq!(descriptor.kind, DatasetKind::Derivative);
    assert_eq!(descriptor.declared_source_ids, vec!["ds000001".to_string()]);
    assert_eq!(descriptor.instance_id, None);
}

#[test]
fn plan_validation_checks_declared_sources() {
    let ds1: DatasetId = "ds1".parse().unwrap();
    let good = DatasetDescriptor::derivative(
        "ds1-qc".parse().unwrap(),
        "u",
        rev('b'),
        vec!["ds1".to_string()],
    );
    let stray = DatasetDescriptor::derivative(
        "ds2-qc".parse().unwrap(),
        "u",
        rev('b'),
        vec!["ds2".to_string()],
    );
    let descriptors = [good.clone(), stray.clone()];
    let lookup = |id: &DatasetId| descriptors.iter().find(|d| &d.id == id);

    let mut plan = StudyPlan::new(BTreeSet::from([ds1]));
    plan.derivative_ids.insert(good.id.clone());
    assert!(plan.validate(lookup).is_ok());

    plan.derivative_ids.insert(stray.id.clone());
    assert_matches!(plan.validate(lookup), Err(StudyError::InvalidPlan { .. }));

    let empty = StudyPlan::new(BTreeSet::new());
    assert_matches!(empty.validate(lookup), Err(StudyError::InvalidPlan { .. }));
}
