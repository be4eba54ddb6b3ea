use resq_mesh::MeshConfig;
use std::env;
use std::str::FromStr;

/// Output format of the simulator's logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => anyhow::bail!("unknown log format: {}", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Nodes placed in a line, each in range of its neighbours only (default: 4)
    pub nodes: usize,
    pub log_format: LogFormat,
    /// Settings shared by every simulated node
    pub mesh: MeshConfig,
}

impl SimConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let nodes: usize = env::var("MESH_SIM_NODES")
            .unwrap_or_else(|_| "4".to_string())
            .parse()?;
        if nodes < 2 {
            anyhow::bail!("MESH_SIM_NODES must be at least 2, got {}", nodes);
        }

        Ok(SimConfig {
            nodes,
            log_format: env::var("MESH_SIM_LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .parse()?,
            mesh: MeshConfig::from_env()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
