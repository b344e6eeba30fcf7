use ssr_core::config::{ConfigError, ConfigProperties, ConfigValue, PropertyMeta, SsrConfig};

#[test]
fn test_empty_config() {
    let config = SsrConfig::empty();
    assert!(config.get::<String>("nonexistent").is_err());
}

#[test]
fn test_set_and_get() {
    let mut config = SsrConfig::empty();
    config.set("app.name", ConfigValue::String("test".into()));
    assert_eq!(config.get::<String>("app.name").unwrap(), "test");
}

#[test]
fn test_get_or_default() {
    let config = SsrConfig::empty();
    assert_eq!(config.get_or("missing", 42i64), 42);
}

#[test]
fn test_type_conversions() {
    let mut config = SsrConfig::empty();
    config.set("int_val", ConfigValue::Integer(42));
    config.set("float_val", ConfigValue::Float(3.14));
    config.set("bool_val", ConfigValue::Bool(true));
    config.set("null_val", ConfigValue::Null);

    assert_eq!(config.get::<i64>("int_val").unwrap(), 42);
    assert_eq!(config.get::<f64>("float_val").unwrap(), 3.14);
    assert!(config.get::<bool>("bool_val").unwrap());
    assert_eq!(config.get::<String>("int_val").unwrap(), "42");
    assert!(config.get::<Option<String>>("null_val").unwrap().is_none());
}

#[test]
fn test_flatten_yaml() {
    let yaml = r#"
app:
  database:
    url: "sqlite::memory:"
    pool_size: 10
  name: "test"
"#;
    let config = SsrConfig::from_yaml_str(yaml, "test").unwrap();

    assert_eq!(
        config.get::<String>("app.database.url").unwrap(),
        "sqlite::memory:"
    );
    assert_eq!(config.get::<i64>("app.database.pool_size").unwrap(), 10);
    assert_eq!(config.get::<String>("app.name").unwrap(), "test");
}

#[test]
fn test_list_config() {
    let yaml = r#"
app:
  origins:
    - "http://localhost"
    - "https://prod.com"
"#;
    let config = SsrConfig::from_yaml_str(yaml, "test").unwrap();
    let origins: Vec<String> = config.get("app.origins").unwrap();
    assert_eq!(origins, vec!["http://localhost", "https://prod.com"]);
}

#[test]
fn test_list_indexed_access() {
    let yaml = r#"
app:
  features:
    - "openapi"
    - "prometheus"
"#;
    let config = SsrConfig::from_yaml_str(yaml, "test").unwrap();
    assert_eq!(config.get::<String>("app.features.0").unwrap(), "openapi");
    assert_eq!(
        config.get::<String>("app.features.1").unwrap(),
        "prometheus"
    );
}

#[test]
fn test_single_value_as_vec() {
    let mut config = SsrConfig::empty();
    config.set("single", ConfigValue::String("only-one".into()));
    let result: Vec<String> = config.get("single").unwrap();
    assert_eq!(result, vec!["only-one"]);
}

#[test]
fn test_contains_key() {
    let mut config = SsrConfig::empty();
    config.set("exists", ConfigValue::String("yes".into()));
    assert!(config.contains_key("exists"));
    assert!(!config.contains_key("nope"));
}

// -------------------------------------------------------------------------
// ConfigProperties — hand-implemented (no derive macro in this stack); the
// server's own `ServerConfig` (frontend-ssr-web) follows this same pattern.
// -------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct DatabaseConfig {
    url: String,
    pool_size: i64,
    timeout: Option<i64>,
}

impl ConfigProperties for DatabaseConfig {
    fn prefix() -> &'static str {
        "app.database"
    }

    fn properties_metadata() -> Vec<PropertyMeta> {
        vec![
            PropertyMeta {
                key: "url".into(),
                full_key: "app.database.url".into(),
                type_name: "String",
                required: true,
                default_value: None,
                description: None,
                is_section: false,
                env_var: None,
            },
            PropertyMeta {
                key: "pool_size".into(),
                full_key: "app.database.pool_size".into(),
                type_name: "i64",
                required: false,
                default_value: Some("10".into()),
                description: None,
                is_section: false,
                env_var: None,
            },
            PropertyMeta {
                key: "timeout".into(),
                full_key: "app.database.timeout".into(),
                type_name: "Option<i64>",
                required: false,
                default_value: None,
                description: None,
                is_section: false,
                env_var: None,
            },
        ]
    }

    fn from_config(config: &SsrConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            url: config.get("app.database.url")?,
            pool_size: config.get_or("app.database.pool_size", 10),
            timeout: config.get("app.database.timeout").ok(),
        })
    }
}

#[test]
fn test_config_properties_basic() {
    let yaml = r#"
app:
  database:
    url: "postgres://localhost/mydb"
"#;
    let config = SsrConfig::from_yaml_str(yaml, "test").unwrap();
    let db = DatabaseConfig::from_config(&config).unwrap();

    assert_eq!(db.url, "postgres://localhost/mydb");
    assert_eq!(db.pool_size, 10); // default applied
    assert!(db.timeout.is_none());
}

#[test]
fn test_config_properties_override_default() {
    let yaml = r#"
app:
  database:
    url: "postgres://localhost/mydb"
    pool_size: 50
    timeout: 30
"#;
    let config = SsrConfig::from_yaml_str(yaml, "test").unwrap();
    let db = DatabaseConfig::from_config(&config).unwrap();

    assert_eq!(db.pool_size, 50);
    assert_eq!(db.timeout, Some(30));
}

#[test]
fn test_config_properties_missing_required() {
    let config = SsrConfig::empty();
    let result = DatabaseConfig::from_config(&config);
    assert!(result.is_err());
}

#[test]
fn test_with_typed_basic() {
    let yaml = r#"
app:
  database:
    url: "postgres://localhost/mydb"
"#;
    let config = SsrConfig::from_yaml_str(yaml, "test")
        .unwrap()
        .with_typed::<DatabaseConfig>()
        .unwrap();

    assert_eq!(config.url, "postgres://localhost/mydb");
    assert_eq!(config.pool_size, 10);
    assert_eq!(
        config.get::<String>("app.database.url").unwrap(),
        "postgres://localhost/mydb"
    );
}

#[test]
fn test_with_typed_profile() {
    let yaml = r#"
app:
  database:
    url: "postgres://localhost/mydb"
"#;
    let config = SsrConfig::from_yaml_str(yaml, "staging")
        .unwrap()
        .with_typed::<DatabaseConfig>()
        .unwrap();

    assert_eq!(config.profile(), "staging");
}

#[test]
fn test_raw_downgrade() {
    let yaml = r#"
app:
  database:
    url: "postgres://localhost/mydb"
"#;
    let typed_config = SsrConfig::from_yaml_str(yaml, "test")
        .unwrap()
        .with_typed::<DatabaseConfig>()
        .unwrap();

    let raw = typed_config.raw();
    assert_eq!(
        raw.get::<String>("app.database.url").unwrap(),
        "postgres://localhost/mydb"
    );
}

// -------------------------------------------------------------------------
// FromConfigValue — numeric types
// -------------------------------------------------------------------------

#[test]
fn test_from_config_value_u16() {
    let mut config = SsrConfig::empty();
    config.set("port", ConfigValue::Integer(8080));
    assert_eq!(config.get::<u16>("port").unwrap(), 8080);
}

#[test]
fn test_from_config_value_u8_out_of_range() {
    let mut config = SsrConfig::empty();
    config.set("level", ConfigValue::Integer(256));
    assert!(config.get::<u8>("level").is_err());
}

#[test]
fn test_from_config_value_hashmap() {
    use std::collections::HashMap;
    let mut inner = HashMap::new();
    inner.insert("env".to_string(), ConfigValue::String("production".into()));
    inner.insert("region".to_string(), ConfigValue::String("us-east".into()));
    let mut config = SsrConfig::empty();
    config.set("labels", ConfigValue::Map(inner));

    let labels: HashMap<String, String> = config.get("labels").unwrap();
    assert_eq!(labels.get("env").unwrap(), "production");
    assert_eq!(labels.get("region").unwrap(), "us-east");
}

#[test]
fn test_config_validation_error_display() {
    use ssr_core::config::ConfigValidationDetail;
    let err = ConfigError::Validation(vec![ConfigValidationDetail {
        key: "app.port".to_string(),
        message: "must be between 1 and 65535".to_string(),
    }]);
    let msg = err.to_string();
    assert!(msg.contains("app.port"));
    assert!(msg.contains("must be between 1 and 65535"));
}
