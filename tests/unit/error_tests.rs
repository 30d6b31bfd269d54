use crackq::errors::ErrorKind;
use crackq::AppError;

#[test]
fn display_prefixes_kind() {
    let cases = [
        (AppError::InvalidJobSpec("x".into()), "invalid job spec: x"),
        (AppError::ProcessSpawnFailed("x".into()), "process spawn failed: x"),
        (AppError::UnexpectedExit("x".into()), "unexpected exit: x"),
        (AppError::StatusStreamMalformed("x".into()), "status stream malformed: x"),
        (AppError::CorruptCheckpoint("x".into()), "corrupt checkpoint: x"),
        (AppError::InvalidTransition("x".into()), "invalid transition: x"),
        (AppError::DeviceError("x".into()), "device error: x"),
        (AppError::NotFound("x".into()), "not found: x"),
    ];
    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
        assert_eq!(err.detail(), "x");
    }
}

#[test]
fn kind_is_stable_and_serializable() {
    let err = AppError::CorruptCheckpoint("bad".into());
    assert_eq!(err.kind(), ErrorKind::CorruptCheckpoint);
    assert_eq!(
        serde_json::to_string(&err.kind()).expect("json"),
        "\"CorruptCheckpoint\""
    );
}

#[test]
fn io_errors_convert() {
    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
    let err: AppError = io.into();
    assert_eq!(err.kind(), ErrorKind::Io);
}

#[test]
fn toml_errors_convert_to_config() {
    let parse = toml::from_str::<toml::Value>("= broken").expect_err("bad toml");
    let err: AppError = parse.into();
    assert!(matches!(err, AppError::Config(_)));
}
