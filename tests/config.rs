use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use study_organizer::config::{Config, ConfigLoader, CommitterEntry, DEFAULT_GITHUB_ORG};
use study_organizer::error::StudyError;

fn temp_path(temp: &tempfile::TempDir, name: &str) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(temp.path().join(name)).unwrap()
}

#[test]
fn parse_config_overrides() {
    let config = Config {
        schema_version: None,
        github_org: Some("MyStudies".to_string()),
        workers: Some(4),
        allow_relink: Some(true),
        committer: Some(CommitterEntry {
            name: Some("Curator".to_string()),
            email: None,
        }),
    };

    let resolved = ConfigLoader::resolve_config(config).unwrap();
    assert_eq!(resolved.schema_version, 1);
    assert_eq!(resolved.github_org, "MyStudies");
    assert_eq!(resolved.workers, 4);
    assert!(resolved.allow_relink);
    assert_eq!(resolved.committer.name, "Curator");
    assert_eq!(resolved.committer.email, "study-org@localhost");
}

#[test]
fn invalid_values_are_rejected() {
    let zero_workers = Config {
        workers: Some(0),
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(zero_workers),
        Err(StudyError::InvalidConfig(_))
    );

    let bad_org = Config {
        github_org: Some("org/with/slash".to_string()),
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(bad_org),
        Err(StudyError::InvalidConfig(_))
    );

    let future = Config {
        schema_version: Some(2),
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(future),
        Err(StudyError::InvalidConfig(_))
    );
}

#[test]
fn missing_default_file_yields_defaults() {
    let temp = tempfile::tempdir().unwrap();
    let resolved = ConfigLoader::resolve(None, &temp_path(&temp, "study-org.json")).unwrap();
    assert_eq!(resolved.github_org, DEFAULT_GITHUB_ORG);
}

#[test]
fn missing_explicit_file_is_an_error() {
    let temp = tempfile::tempdir().unwrap();
    let explicit = temp_path(&temp, "elsewhere.json");
    let err = ConfigLoader::resolve(Some(&explicit), &temp_path(&temp, "study-org.json"))
        .unwrap_err();
    assert_matches!(err, StudyError::ConfigRead(path) if path == explicit);
}

#[test]
fn file_is_parsed() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp_path(&temp, "study-org.json");
    std::fs::write(
        path.as_std_path(),
        r#"{"schema_version": 1, "github_org": "Lab", "workers": 3}"#,
    )
    .unwrap();
    let resolved = ConfigLoader::resolve(None, &path).unwrap();
    assert_eq!(resolved.github_org, "Lab");
    assert_eq!(resolved.workers, 3);

    std::fs::write(path.as_std_path(), "{not json").unwrap();
    assert_matches!(
        ConfigLoader::resolve(None, &path),
        Err(StudyError::ConfigParse(_))
    );
}
