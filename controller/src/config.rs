use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub metric: MetricConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub times: TimesConfig,
    #[serde(default)]
    pub hostapd: HostapdConfig,
    #[serde(default = "default_maclist_path")]
    pub maclist_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            metric: MetricConfig::default(),
            network: NetworkConfig::default(),
            times: TimesConfig::default(),
            hostapd: HostapdConfig::default(),
            maclist_path: default_maclist_path(),
        }
    }
}

/// Scoring weights, thresholds and steering toggles.
///
/// Weights are signed so a "penalty" is just a negative weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricConfig {
    #[serde(default = "default_ht_support")]
    pub ht_support: i32,
    #[serde(default = "default_vht_support")]
    pub vht_support: i32,
    #[serde(default)]
    pub no_ht_support: i32,
    #[serde(default)]
    pub no_vht_support: i32,
    #[serde(default = "default_rssi")]
    pub rssi: i32,
    #[serde(default = "default_low_rssi")]
    pub low_rssi: i32,
    #[serde(default = "default_freq")]
    pub freq: i32,
    #[serde(default)]
    pub chan_util: i32,
    #[serde(default = "default_max_chan_util")]
    pub max_chan_util: i32,

    #[serde(default = "default_min_rssi")]
    pub min_rssi: i32,
    #[serde(default = "default_rssi_threshold_high")]
    pub rssi_threshold_high: i32,
    #[serde(default = "default_rssi_threshold_low")]
    pub rssi_threshold_low: i32,
    #[serde(default = "default_chan_util_low")]
    pub chan_util_low: i32,
    #[serde(default = "default_chan_util_high")]
    pub chan_util_high: i32,

    #[serde(default = "default_min_probe_count")]
    pub min_probe_count: u32,
    #[serde(default = "default_chan_util_avg_period")]
    pub chan_util_avg_period: u32,
    #[serde(default = "default_min_kick_count")]
    pub min_kick_count: u64,
    #[serde(default = "default_ageing_time")]
    pub ageing_time: u64,
    #[serde(default = "default_bandwidth_threshold")]
    pub bandwidth_threshold: i32,

    #[serde(default)]
    pub eval_probe_req: bool,
    #[serde(default)]
    pub eval_auth_req: bool,
    #[serde(default)]
    pub eval_assoc_req: bool,
    #[serde(default)]
    pub kicking: bool,
    #[serde(default = "default_true")]
    pub use_driver_recog: bool,

    #[serde(default = "default_deny_reason")]
    pub deny_auth_reason: u16,
    #[serde(default = "default_deny_reason")]
    pub deny_assoc_reason: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// 0 = UDP multicast, 1 = UDP broadcast, 2 = TCP mesh.
    #[serde(default)]
    pub option: u8,
    #[serde(default = "default_network_ip")]
    pub ip: String,
    #[serde(default = "default_network_port")]
    pub port: u16,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    #[serde(default)]
    pub use_symm_enc: bool,
    #[serde(default)]
    pub shared_key: String,
    #[serde(default = "default_unknown")]
    pub collision_domain: i32,
    #[serde(default = "default_unknown")]
    pub bandwidth: i32,
}

/// Periods of the recurring control loops, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimesConfig {
    #[serde(default = "default_update_client")]
    pub update_client: u64,
    #[serde(default = "default_update_chan_util")]
    pub update_chan_util: u64,
    #[serde(default = "default_update_hostapd")]
    pub update_hostapd: u64,
    #[serde(default = "default_update_tcp_con")]
    pub update_tcp_con: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostapdConfig {
    #[serde(default = "default_socket_dir")]
    pub socket_dir: String,
    /// Ban time passed to del_client when kicking, in seconds.
    #[serde(default = "default_ban_time")]
    pub ban_time: u32,
}

fn default_maclist_path() -> String {
    "/etc/dawn/mac_list".to_string()
}

fn default_ht_support() -> i32 {
    10
}

fn default_vht_support() -> i32 {
    100
}

fn default_rssi() -> i32 {
    10
}

fn default_low_rssi() -> i32 {
    -500
}

fn default_freq() -> i32 {
    100
}

fn default_max_chan_util() -> i32 {
    -500
}

fn default_min_rssi() -> i32 {
    -80
}

fn default_rssi_threshold_high() -> i32 {
    -60
}

fn default_rssi_threshold_low() -> i32 {
    -80
}

fn default_chan_util_low() -> i32 {
    140
}

fn default_chan_util_high() -> i32 {
    170
}

fn default_min_probe_count() -> u32 {
    2
}

fn default_chan_util_avg_period() -> u32 {
    3
}

fn default_min_kick_count() -> u64 {
    3
}

fn default_ageing_time() -> u64 {
    60
}

fn default_bandwidth_threshold() -> i32 {
    6
}

fn default_true() -> bool {
    true
}

fn default_deny_reason() -> u16 {
    17 // AP unable to handle additional STAs
}

fn default_network_ip() -> String {
    "225.0.0.37".to_string()
}

fn default_network_port() -> u16 {
    1025
}

fn default_tcp_port() -> u16 {
    1026
}

fn default_unknown() -> i32 {
    -1
}

fn default_update_client() -> u64 {
    10
}

fn default_update_chan_util() -> u64 {
    5
}

fn default_update_hostapd() -> u64 {
    10
}

fn default_update_tcp_con() -> u64 {
    10
}

fn default_socket_dir() -> String {
    "/var/run/hostapd".to_string()
}

fn default_ban_time() -> u32 {
    15
}

impl Default for MetricConfig {
    fn default() -> Self {
        Self {
            ht_support: default_ht_support(),
            vht_support: default_vht_support(),
            no_ht_support: 0,
            no_vht_support: 0,
            rssi: default_rssi(),
            low_rssi: default_low_rssi(),
            freq: default_freq(),
            chan_util: 0,
            max_chan_util: default_max_chan_util(),
            min_rssi: default_min_rssi(),
            rssi_threshold_high: default_rssi_threshold_high(),
            rssi_threshold_low: default_rssi_threshold_low(),
            chan_util_low: default_chan_util_low(),
            chan_util_high: default_chan_util_high(),
            min_probe_count: default_min_probe_count(),
            chan_util_avg_period: default_chan_util_avg_period(),
            min_kick_count: default_min_kick_count(),
            ageing_time: default_ageing_time(),
            bandwidth_threshold: default_bandwidth_threshold(),
            eval_probe_req: false,
            eval_auth_req: false,
            eval_assoc_req: false,
            kicking: false,
            use_driver_recog: default_true(),
            deny_auth_reason: default_deny_reason(),
            deny_assoc_reason: default_deny_reason(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            option: 0,
            ip: default_network_ip(),
            port: default_network_port(),
            tcp_port: default_tcp_port(),
            use_symm_enc: false,
            shared_key: String::new(),
            collision_domain: default_unknown(),
            bandwidth: default_unknown(),
        }
    }
}

impl Default for TimesConfig {
    fn default() -> Self {
        Self {
            update_client: default_update_client(),
            update_chan_util: default_update_chan_util(),
            update_hostapd: default_update_hostapd(),
            update_tcp_con: default_update_tcp_con(),
        }
    }
}

impl Default for HostapdConfig {
    fn default() -> Self {
        Self {
            socket_dir: default_socket_dir(),
            ban_time: default_ban_time(),
        }
    }
}

impl Config {
    /// Load `/etc/dawn/dawn.conf` (TOML, optional) with `DAWN__`-prefixed
    /// environment overrides, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("/etc/dawn/dawn")
    }

    pub fn load_from(base_name: &str) -> Result<Self, ConfigError> {
        let loaded = config::Config::builder()
            .add_source(config::File::with_name(base_name).required(false))
            .add_source(config::Environment::with_prefix("DAWN").separator("__"))
            .build()?;

        let config: Config = loaded.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.option > 2 {
            return Err(ConfigError::Invalid(format!(
                "network.option must be 0 (multicast), 1 (broadcast) or 2 (tcp), got {}",
                self.network.option
            )));
        }
        if self.network.option < 2 && self.network.ip.parse::<std::net::Ipv4Addr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "network.ip is not a valid IPv4 address: {:?}",
                self.network.ip
            )));
        }
        if self.network.use_symm_enc && self.network.shared_key.is_empty() {
            return Err(ConfigError::Invalid(
                "network.use_symm_enc is set but network.shared_key is empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.metric.min_probe_count, 2);
        assert_eq!(config.metric.deny_auth_reason, 17);
        assert_eq!(config.metric.ageing_time, 60);
        assert!(config.metric.use_driver_recog);
        assert!(!config.metric.kicking);
        assert_eq!(config.network.option, 0);
        assert_eq!(config.network.collision_domain, -1);
        assert_eq!(config.times.update_client, 10);
        assert_eq!(config.hostapd.socket_dir, "/var/run/hostapd");
        assert_eq!(config.maclist_path, "/etc/dawn/mac_list");
    }

    #[test]
    fn test_encryption_requires_key() {
        let mut config = Config::default();
        config.network.use_symm_enc = true;
        assert!(config.validate().is_err());
        config.network.shared_key = "secret".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_unknown_network_option() {
        let mut config = Config::default();
        config.network.option = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_replication_ip() {
        let mut config = Config::default();
        config.network.ip = "not-an-ip".to_string();
        assert!(config.validate().is_err());
        // A TCP mesh does not use network.ip at all.
        config.network.option = 2;
        assert!(config.validate().is_ok());
    }
}
