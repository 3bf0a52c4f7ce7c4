use anyhow::anyhow;
use anyhow::bail;
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::Path;

/// Read a file and parse its content into the specified type.
///
/// Trims null and whitespace before parsing.
///
/// # Errors
/// Returns an error if reading or parsing fails.
pub fn read_from_file<T>(path: &Path) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let val = match std::fs::read_to_string(path) {
        Ok(val) => val,
        Err(_) => {
            bail!("Failed to open or read file {:?}", path);
        }
    };
    let val = val.trim_end_matches('\0');

    match val.trim().parse::<T>() {
        Ok(parsed) => Ok(parsed),
        Err(_) => {
            bail!("Failed to parse content '{}' from {:?}", val.trim(), path);
        }
    }
}

/// Read a "key value" file such as memory.stat into a map. Lines that do not
/// carry a numeric value are skipped.
pub fn read_file_kv(path: &Path) -> Result<BTreeMap<String, u64>> {
    let val = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("Failed to open or read file {:?}: {}", path, e))?;
    Ok(parse_kv(&val))
}

pub fn parse_kv(content: &str) -> BTreeMap<String, u64> {
    let mut map = BTreeMap::new();
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let (Some(key), Some(value)) = (fields.next(), fields.next()) else {
            continue;
        };
        if let Ok(value) = value.parse::<u64>() {
            map.insert(key.trim_end_matches(':').to_string(), value);
        }
    }
    map
}

/// Read a cgroup style limit file, where "max" means unlimited.
pub fn read_limit_file(path: &Path) -> Result<Option<u64>> {
    let val: String = read_from_file(path)?;
    if val == "max" {
        return Ok(None);
    }
    val.parse::<u64>()
        .map(Some)
        .map_err(|_| anyhow!("Failed to parse limit '{}' from {:?}", val, path))
}

pub fn sub_or_zero(curr: u64, prev: u64) -> u64 {
    curr.checked_sub(prev).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_kv_skips_garbage() {
        let map = parse_kv("rss 100\ncache 20\nbogus\nMemFree:  300 kB\nname text\n");
        assert_eq!(map["rss"], 100);
        assert_eq!(map["cache"], 20);
        assert_eq!(map["MemFree"], 300);
        assert!(!map.contains_key("name"));
    }

    #[test]
    fn test_read_limit_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("memory.max");
        std::fs::write(&path, "max\n").unwrap();
        assert_eq!(read_limit_file(&path).unwrap(), None);
        std::fs::write(&path, "4096\n").unwrap();
        assert_eq!(read_limit_file(&path).unwrap(), Some(4096));
        assert!(read_limit_file(&tmp.path().join("missing")).is_err());
    }
}
