use std::env;
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::client::DEFAULT_PAGE_LIMIT;
use crate::coordinates::{FillMode, RowLabelScheme};
use crate::engine::{CommitPolicy, PlacementConfig};
use crate::model::GridDimensions;

/// Complete application configuration, loaded from environment variables or default values.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub backend: BackendConfig,
    pub placement: PlacementDefaults,
}

impl AppConfig {
    /// Creates a configuration from the currently available environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(&env_string)
    }

    fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        Self {
            api: ApiConfig::from_lookup(lookup),
            backend: BackendConfig::from_lookup(lookup),
            placement: PlacementDefaults::from_lookup(lookup),
        }
    }
}

/// Configuration for the API server.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    bind_ip: IpAddr,
    display_host: String,
    port: u16,
}

impl ApiConfig {
    const DEFAULT_HOST: &'static str = "0.0.0.0";
    const DEFAULT_PORT: u16 = 8080;
    const HOST_VAR: &'static str = "PLATE_LAYOUT_API_HOST";
    const PORT_VAR: &'static str = "PLATE_LAYOUT_API_PORT";

    fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        let host_value = lookup(Self::HOST_VAR).unwrap_or_else(|| Self::DEFAULT_HOST.to_string());
        let (bind_ip, display_host) = match host_value.parse::<IpAddr>() {
            Ok(ip) => (ip, host_value),
            Err(err) => {
                warn!(
                    "Could not parse {} ('{}'): {}. Using {}.",
                    Self::HOST_VAR,
                    host_value,
                    err,
                    Self::DEFAULT_HOST
                );
                (
                    IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    Self::DEFAULT_HOST.to_string(),
                )
            }
        };

        let port = parse_with_warning(
            Self::PORT_VAR,
            lookup(Self::PORT_VAR),
            Self::DEFAULT_PORT,
            |value| *value != 0,
            "must not be 0",
        );

        Self {
            bind_ip,
            display_host,
            port,
        }
    }

    /// Socket address to bind the server to.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }

    /// Visible hostname for logging and hints.
    pub fn display_host(&self) -> &str {
        &self.display_host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Indicates whether binding to all interfaces.
    pub fn binds_to_all_interfaces(&self) -> bool {
        match self.bind_ip {
            IpAddr::V4(addr) => addr == Ipv4Addr::UNSPECIFIED,
            IpAddr::V6(addr) => addr == Ipv6Addr::UNSPECIFIED,
        }
    }
}

/// Where items are fetched from and saved to.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    url: Option<String>,
    token: Option<String>,
    timeout: Duration,
    page_limit: u32,
    seed_file: Option<PathBuf>,
}

impl BackendConfig {
    const DEFAULT_TIMEOUT_SECS: u64 = 30;
    const URL_VAR: &'static str = "PLATE_LAYOUT_BACKEND_URL";
    const TOKEN_VAR: &'static str = "PLATE_LAYOUT_BACKEND_TOKEN";
    const TIMEOUT_VAR: &'static str = "PLATE_LAYOUT_HTTP_TIMEOUT_SECS";
    const PAGE_LIMIT_VAR: &'static str = "PLATE_LAYOUT_PAGE_LIMIT";
    const SEED_FILE_VAR: &'static str = "PLATE_LAYOUT_SEED_FILE";

    fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        let timeout_secs = parse_with_warning(
            Self::TIMEOUT_VAR,
            lookup(Self::TIMEOUT_VAR),
            Self::DEFAULT_TIMEOUT_SECS,
            |value| *value > 0,
            "must be greater than 0",
        );
        let page_limit = parse_with_warning(
            Self::PAGE_LIMIT_VAR,
            lookup(Self::PAGE_LIMIT_VAR),
            DEFAULT_PAGE_LIMIT,
            |value| *value > 0,
            "must be greater than 0",
        );

        Self {
            url: lookup(Self::URL_VAR),
            token: lookup(Self::TOKEN_VAR),
            timeout: Duration::from_secs(timeout_secs),
            page_limit,
            seed_file: lookup(Self::SEED_FILE_VAR).map(PathBuf::from),
        }
    }

    /// Base URL of the JSON:API store; `None` selects the in-memory store.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn page_limit(&self) -> u32 {
        self.page_limit
    }

    /// JSON file with batches for the in-memory store.
    pub fn seed_file(&self) -> Option<&PathBuf> {
        self.seed_file.as_ref()
    }
}

/// Engine settings applied to every new session unless the request overrides them.
#[derive(Clone, Debug)]
pub struct PlacementDefaults {
    placement: PlacementConfig,
    dimensions: GridDimensions,
    natural_sort: bool,
}

impl PlacementDefaults {
    const DEFAULT_ROWS: u32 = 8;
    const DEFAULT_COLUMNS: u32 = 12;
    const FILL_MODE_VAR: &'static str = "PLATE_LAYOUT_FILL_MODE";
    const ROW_LABELS_VAR: &'static str = "PLATE_LAYOUT_ROW_LABELS";
    const COMMIT_POLICY_VAR: &'static str = "PLATE_LAYOUT_COMMIT_POLICY";
    const ROWS_VAR: &'static str = "PLATE_LAYOUT_DEFAULT_ROWS";
    const COLUMNS_VAR: &'static str = "PLATE_LAYOUT_DEFAULT_COLUMNS";
    const NATURAL_SORT_VAR: &'static str = "PLATE_LAYOUT_NATURAL_SORT";

    fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        let fill_mode = parse_with_warning(
            Self::FILL_MODE_VAR,
            lookup(Self::FILL_MODE_VAR),
            FillMode::default(),
            |_| true,
            "",
        );
        let row_labels = parse_with_warning(
            Self::ROW_LABELS_VAR,
            lookup(Self::ROW_LABELS_VAR),
            RowLabelScheme::default(),
            |_| true,
            "",
        );
        let commit_policy = parse_with_warning(
            Self::COMMIT_POLICY_VAR,
            lookup(Self::COMMIT_POLICY_VAR),
            CommitPolicy::default(),
            |_| true,
            "",
        );
        let rows = parse_with_warning(
            Self::ROWS_VAR,
            lookup(Self::ROWS_VAR),
            Self::DEFAULT_ROWS,
            |value| *value > 0,
            "must be greater than 0",
        );
        let columns = parse_with_warning(
            Self::COLUMNS_VAR,
            lookup(Self::COLUMNS_VAR),
            Self::DEFAULT_COLUMNS,
            |value| *value > 0,
            "must be greater than 0",
        );
        let natural_sort = lookup(Self::NATURAL_SORT_VAR)
            .and_then(|raw| parse_bool(&raw, Self::NATURAL_SORT_VAR))
            .unwrap_or(false);

        let placement = PlacementConfig::builder()
            .fill_mode(fill_mode)
            .row_labels(row_labels)
            .commit_policy(commit_policy)
            .build();

        let fallback = GridDimensions {
            number_of_rows: Self::DEFAULT_ROWS,
            number_of_columns: Self::DEFAULT_COLUMNS,
        };
        let dimensions = match GridDimensions::new(rows, columns) {
            Ok(dims) if placement.validate_for(&dims).is_ok() => dims,
            _ => {
                warn!(
                    "Default plate {}x{} does not fit the {} row labels. Using {}x{}.",
                    rows,
                    columns,
                    row_labels,
                    Self::DEFAULT_ROWS,
                    Self::DEFAULT_COLUMNS
                );
                fallback
            }
        };

        Self {
            placement,
            dimensions,
            natural_sort,
        }
    }

    pub fn placement(&self) -> PlacementConfig {
        self.placement
    }

    /// Plate size used when a session is opened without explicit dimensions.
    pub fn dimensions(&self) -> GridDimensions {
        self.dimensions
    }

    /// Whether `move_all` sorts by name unless told otherwise.
    pub fn natural_sort(&self) -> bool {
        self.natural_sort
    }
}

impl Default for PlacementDefaults {
    fn default() -> Self {
        Self::from_lookup(&|_| None)
    }
}

fn env_string(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_owned())
            }
        }
        Err(env::VarError::NotPresent) => None,
        Err(err) => {
            warn!("Access to {} failed: {}. Using default value.", name, err);
            None
        }
    }
}

fn parse_bool(raw: &str, var_name: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        other => {
            warn!(
                "Could not interpret {} ('{}') as boolean value. Using default value.",
                var_name, other
            );
            None
        }
    }
}

fn parse_with_warning<T>(
    var_name: &str,
    raw: Option<String>,
    default: T,
    validator: impl Fn(&T) -> bool,
    invalid_hint: &str,
) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if validator(&value) => value,
        Ok(_) => {
            warn!(
                "{} contains invalid value '{}': {}. Using {}.",
                var_name, raw, invalid_hint, default
            );
            default
        }
        Err(err) => {
            warn!(
                "Could not parse {} ('{}'): {}. Using {}.",
                var_name, raw, err, default
            );
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let values: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |name| values.get(name).cloned()
    }

    #[test]
    fn test_parse_bool_values() {
        assert_eq!(parse_bool("1", "TEST_VAR"), Some(true));
        assert_eq!(parse_bool(" Yes ", "TEST_VAR"), Some(true));
        assert_eq!(parse_bool("OFF", "TEST_VAR"), Some(false));
        assert_eq!(parse_bool("n", "TEST_VAR"), Some(false));
        assert_eq!(parse_bool("maybe", "TEST_VAR"), None);
    }

    #[test]
    fn test_parse_with_warning_falls_back() {
        assert_eq!(parse_with_warning("V", None, 7u32, |_| true, ""), 7);
        assert_eq!(parse_with_warning("V", Some(" 9 ".into()), 7u32, |_| true, ""), 9);
        assert_eq!(parse_with_warning("V", Some("nine".into()), 7u32, |_| true, ""), 7);
        assert_eq!(
            parse_with_warning("V", Some("0".into()), 7u32, |v| *v > 0, "must be greater than 0"),
            7
        );
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = AppConfig::from_lookup(&lookup_from(&[]));

        assert_eq!(config.api.port(), 8080);
        assert!(config.api.binds_to_all_interfaces());
        assert_eq!(config.backend.url(), None);
        assert_eq!(config.backend.timeout(), Duration::from_secs(30));
        assert_eq!(config.backend.page_limit(), 1000);

        let placement = config.placement.placement();
        assert_eq!(placement.fill_mode, FillMode::Row);
        assert_eq!(placement.row_labels, RowLabelScheme::Spreadsheet);
        assert_eq!(placement.commit_policy, CommitPolicy::Changed);
        assert_eq!(config.placement.dimensions().capacity(), 96);
        assert!(!config.placement.natural_sort());
    }

    #[test]
    fn test_reads_overrides() {
        let config = AppConfig::from_lookup(&lookup_from(&[
            ("PLATE_LAYOUT_API_HOST", "127.0.0.1"),
            ("PLATE_LAYOUT_API_PORT", "9000"),
            ("PLATE_LAYOUT_BACKEND_URL", "https://lab.example/api"),
            ("PLATE_LAYOUT_FILL_MODE", "COLUMN"),
            ("PLATE_LAYOUT_COMMIT_POLICY", "touched"),
            ("PLATE_LAYOUT_DEFAULT_ROWS", "16"),
            ("PLATE_LAYOUT_DEFAULT_COLUMNS", "24"),
            ("PLATE_LAYOUT_NATURAL_SORT", "yes"),
        ]));

        assert_eq!(config.api.socket_addr().to_string(), "127.0.0.1:9000");
        assert!(!config.api.binds_to_all_interfaces());
        assert_eq!(config.backend.url(), Some("https://lab.example/api"));
        assert_eq!(config.placement.placement().fill_mode, FillMode::Column);
        assert_eq!(config.placement.placement().commit_policy, CommitPolicy::Touched);
        assert_eq!(config.placement.dimensions().capacity(), 384);
        assert!(config.placement.natural_sort());
    }

    #[test]
    fn test_invalid_values_use_defaults() {
        let config = AppConfig::from_lookup(&lookup_from(&[
            ("PLATE_LAYOUT_API_HOST", "not-an-ip"),
            ("PLATE_LAYOUT_API_PORT", "0"),
            ("PLATE_LAYOUT_FILL_MODE", "diagonal"),
            ("PLATE_LAYOUT_HTTP_TIMEOUT_SECS", "-1"),
        ]));

        assert_eq!(config.api.display_host(), "0.0.0.0");
        assert_eq!(config.api.port(), 8080);
        assert_eq!(config.placement.placement().fill_mode, FillMode::Row);
        assert_eq!(config.backend.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_rows_beyond_alphabetic_labels_fall_back() {
        let config = AppConfig::from_lookup(&lookup_from(&[
            ("PLATE_LAYOUT_ROW_LABELS", "alphabetic"),
            ("PLATE_LAYOUT_DEFAULT_ROWS", "30"),
        ]));
        assert_eq!(config.placement.dimensions().number_of_rows, 8);
    }
}
