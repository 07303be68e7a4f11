use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
    pub refresh_ttl_minutes: i64,
}

/// Daily sweep schedule knobs. The defaults reproduce the fixed
/// midnight+5min cadence; both are overridable from the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    pub offset_minutes: i64,
    pub min_clamp_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub jwt: JwtConfig,
    pub sweep: SweepConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")?;
        let jwt = JwtConfig {
            secret: std::env::var("JWT_SECRET")?,
            issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "taskdesk".into()),
            audience: std::env::var("JWT_AUDIENCE").unwrap_or_else(|_| "taskdesk-users".into()),
            ttl_minutes: std::env::var("JWT_TTL_MINUTES")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(60 * 12),
            refresh_ttl_minutes: std::env::var("JWT_REFRESH_TTL_MINUTES")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(60 * 24 * 14),
        };
        let sweep = SweepConfig {
            offset_minutes: std::env::var("SWEEP_OFFSET_MINUTES")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(5),
            min_clamp_secs: std::env::var("SWEEP_MIN_CLAMP_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60),
        };
        Ok(Self {
            database_url,
            jwt,
            sweep,
        })
    }
}
