// Copyright PingCAP Inc. 2025.
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; version 2 of the License.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Filesystem root; `storage/` and `tmp/` are created underneath it.
    /// Both must live on the same mount so commit renames stay atomic.
    #[serde(default = "default_root_dir")]
    pub root_dir: String,

    /// HTTP listen address, e.g. "127.0.0.1:5252"
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default)]
    pub trasher: TrasherConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrasherConfig {
    /// Number of removal workers draining the collected-bucket queue.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Seconds between collector scans of the shard directories.
    #[serde(default = "default_collector_delay")]
    pub collector_iterations_delay: u64,

    /// Seconds between worker dequeue attempts.
    #[serde(default = "default_worker_delay")]
    pub worker_iterations_delay: u64,
}

impl Default for TrasherConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            collector_iterations_delay: default_collector_delay(),
            worker_iterations_delay: default_worker_delay(),
        }
    }
}

impl Config {
    pub fn from_path(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let s = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&s)?;
        Ok(cfg)
    }
}

fn default_root_dir() -> String {
    "./data".to_string()
}

fn default_listen_addr() -> String {
    "127.0.0.1:5252".to_string()
}

fn default_workers() -> usize {
    1
}

fn default_collector_delay() -> u64 {
    60
}

fn default_worker_delay() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.root_dir, "./data");
        assert_eq!(cfg.listen_addr, "127.0.0.1:5252");
        assert_eq!(cfg.trasher.workers, 1);
        assert_eq!(cfg.trasher.collector_iterations_delay, 60);
        assert_eq!(cfg.trasher.worker_iterations_delay, 60);
    }

    #[test]
    fn full_config_parses() {
        let cfg: Config = toml::from_str(
            r#"
            root_dir = "/var/lib/bucketstore"
            listen_addr = "0.0.0.0:5252"

            [trasher]
            workers = 4
            collector_iterations_delay = 30
            worker_iterations_delay = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.root_dir, "/var/lib/bucketstore");
        assert_eq!(cfg.trasher.workers, 4);
        assert_eq!(cfg.trasher.collector_iterations_delay, 30);
        assert_eq!(cfg.trasher.worker_iterations_delay, 5);
    }
}
