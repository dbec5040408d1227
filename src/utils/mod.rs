pub mod bins;
pub mod lock;

pub mod time {
    use anyhow::{Context, Result, anyhow};
    use time::{OffsetDateTime, UtcOffset, format_description::well_known::Rfc3339};

    #[inline]
    pub fn current_epoch() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Compact timestamp suitable for filenames, e.g. `20200102-030405`.
    pub fn fmt_compact(ts: u64) -> Result<String> {
        let ts = i64::try_from(ts).map_err(|_| anyhow!("unix timestamp doesn't fit into i64"))?;
        let dt = OffsetDateTime::from_unix_timestamp(ts)?.to_offset(UtcOffset::UTC);
        Ok(format!(
            "{:04}{:02}{:02}-{:02}{:02}{:02}",
            dt.year(),
            u8::from(dt.month()),
            dt.day(),
            dt.hour(),
            dt.minute(),
            dt.second()
        ))
    }

    pub fn fmt_utc(ts: u64) -> Result<String> {
        let ts = i64::try_from(ts).map_err(|_| anyhow!("unix timestamp doesn't fit into i64"))?;
        let dt = OffsetDateTime::from_unix_timestamp(ts)?;
        Ok(dt.format(&Rfc3339)?)
    }

    pub fn parse_rfc3339_to_unix(s: &str) -> Result<u64> {
        let dt = OffsetDateTime::parse(s, &Rfc3339)
            .with_context(|| format!("invalid RFC3339 datetime: {s}"))?
            .to_offset(UtcOffset::UTC);

        let ts = dt.unix_timestamp();
        u64::try_from(ts).map_err(|_| anyhow!("timestamp is negative: {}", ts))
    }

    #[cfg(test)]
    mod tests {
        #[test]
        fn epoch_nonzero() {
            assert!(super::current_epoch() > 1_600_000_000);
        }

        #[test]
        fn compact_roundtrip_shape() {
            let s = super::fmt_compact(1_577_934_245).unwrap();
            assert_eq!(s, "20200102-030405");
        }
    }
}
