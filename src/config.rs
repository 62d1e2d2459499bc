use easy_error::format_err;
use log::debug;
use serde::Deserialize;
use std::error::Error;
use std::fs::read_to_string;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default = "default_lvmlockd_lock_retries")]
    pub lvmlockd_lock_retries: u32,
    #[serde(default = "default_sanlock_align_size")]
    pub sanlock_align_size: u32,
    #[serde(default = "default_sanlock_lv_extend")]
    pub sanlock_lv_extend: u64,
    #[serde(default = "default_min_archive")]
    pub min_archive: u32,
    #[serde(default = "default_retain_days")]
    pub retain_days: u32,
    #[serde(default = "default_archive_dir")]
    pub archive_dir: String,
    #[serde(default = "default_lock_daemon_socket")]
    pub lock_daemon_socket: String,
    pub local_pr_key: Option<String>,
    pub local_host_id: Option<u16>,
    #[serde(default = "default_lvmpersist_path")]
    pub lvmpersist_path: String,
}

fn default_lvmlockd_lock_retries() -> u32 {
    3
}

fn default_sanlock_align_size() -> u32 {
    1
}

fn default_sanlock_lv_extend() -> u64 {
    256
}

fn default_min_archive() -> u32 {
    10
}

fn default_retain_days() -> u32 {
    30
}

fn default_archive_dir() -> String {
    "/etc/lvm/archive".to_string()
}

fn default_lock_daemon_socket() -> String {
    "/run/lvm/lvmlockd.socket".to_string()
}

fn default_lvmpersist_path() -> String {
    "lvmpersist".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            lvmlockd_lock_retries: default_lvmlockd_lock_retries(),
            sanlock_align_size: default_sanlock_align_size(),
            sanlock_lv_extend: default_sanlock_lv_extend(),
            min_archive: default_min_archive(),
            retain_days: default_retain_days(),
            archive_dir: default_archive_dir(),
            lock_daemon_socket: default_lock_daemon_socket(),
            local_pr_key: None,
            local_host_id: None,
            lvmpersist_path: default_lvmpersist_path(),
        }
    }
}

pub fn load(path: String) -> Result<Config, Box<dyn Error>> {
    debug!("trying to read \"{}\"", path);
    let data = read_to_string(&path).map_err(|e| format_err!("cannot read {}: {}", path, e))?;
    let config: Config = serde_json::from_str(&data)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_fields_are_absent() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.lvmlockd_lock_retries, 3);
        assert_eq!(config.sanlock_align_size, 1);
        assert_eq!(config.archive_dir, "/etc/lvm/archive");
        assert!(config.local_pr_key.is_none());
    }

    #[test]
    fn explicit_fields_override_defaults() {
        let json = r#"{"lvmlockd-lock-retries": 5, "local-pr-key": "0x2a"}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.lvmlockd_lock_retries, 5);
        assert_eq!(config.local_pr_key.as_deref(), Some("0x2a"));
    }

    #[test]
    fn load_reports_missing_file_with_its_path() {
        let err = load("/nonexistent/lvmcore.json".to_string()).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/lvmcore.json"));
    }
}
