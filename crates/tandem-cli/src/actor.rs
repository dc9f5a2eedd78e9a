/// `$USER@host`, falling back to `unknown` for either half.
pub fn default_actor() -> String {
    let user = first_env(&["USER", "USERNAME"]).unwrap_or_else(|| "unknown".to_string());
    let host = first_env(&["HOSTNAME", "COMPUTERNAME"])
        .or_else(read_hostname)
        .unwrap_or_else(|| "unknown".to_string());
    format!("{user}@{host}")
}

fn first_env(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| std::env::var(k).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

fn read_hostname() -> Option<String> {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_has_user_and_host() {
        let actor = default_actor();
        let (user, host) = actor.split_once('@').unwrap();
        assert!(!user.is_empty());
        assert!(!host.is_empty());
    }
}
