use bytesize::ByteSize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Memory cap enforced on a single sandbox invocation. Default matches spec.md §4.3.
#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MemoryLimit(pub ByteSize);

impl Default for MemoryLimit {
    fn default() -> Self {
        Self(ByteSize::mib(256))
    }
}

impl FromStr for MemoryLimit {
    type Err = <ByteSize as FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl fmt::Display for MemoryLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl MemoryLimit {
    /// Renders the value the way the sandbox runtime's `--memory` flag expects, e.g. `256m`.
    pub fn as_docker_arg(&self) -> String {
        format!("{}m", self.0.as_u64() / (1024 * 1024))
    }
}

/// Fractional CPU quota, e.g. `0.5` for half a core. Default matches spec.md §4.3.
#[derive(Copy, Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CpuQuota(pub f64);

impl Default for CpuQuota {
    fn default() -> Self {
        Self(0.5)
    }
}

impl FromStr for CpuQuota {
    type Err = std::num::ParseFloatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl fmt::Display for CpuQuota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wall-clock deadline for a single sandbox invocation. Default matches spec.md §4.3.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SandboxTimeout(pub Duration);

impl Default for SandboxTimeout {
    fn default() -> Self {
        Self(Duration::from_secs(15))
    }
}

impl FromStr for SandboxTimeout {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(|secs| Self(Duration::from_secs(secs)))
    }
}

impl fmt::Display for SandboxTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_secs())
    }
}

/// Bounded in-flight job count for the worker pool. Default matches spec.md §4.4.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Concurrency(pub usize);

impl Default for Concurrency {
    fn default() -> Self {
        Self(5)
    }
}

impl FromStr for Concurrency {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl fmt::Display for Concurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_limit_renders_docker_arg() {
        let limit = MemoryLimit::default();
        assert_eq!(limit.as_docker_arg(), "256m");
    }

    #[test]
    fn memory_limit_parses_suffixed_string() {
        let limit: MemoryLimit = "512MiB".parse().unwrap();
        assert_eq!(limit.0, ByteSize::mib(512));
    }

    #[test]
    fn defaults_match_spec() {
        assert_eq!(CpuQuota::default().0, 0.5);
        assert_eq!(SandboxTimeout::default().0, Duration::from_secs(15));
        assert_eq!(Concurrency::default().0, 5);
    }
}
