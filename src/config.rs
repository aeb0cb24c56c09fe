use ::config::Config;

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, config::ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, config::ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_u64(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<u64, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<u64>(key))
}

pub(crate) fn get_namespaced_string(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<String, config::ConfigError> {
    get_namespaced_value(config, name, key, Config::get_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_config() -> Config {
        Config::builder()
            .set_default("buffer_capacity", 64)
            .unwrap()
            .set_default("game_server.buffer_capacity", 128)
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn namespaced_key_takes_priority() {
        let config = build_config();
        assert_eq!(
            get_namespaced_usize(&config, "game_server", "buffer_capacity").unwrap(),
            128
        );
    }

    #[test]
    fn falls_back_to_global_key() {
        let config = build_config();
        assert_eq!(
            get_namespaced_usize(&config, "game_client", "buffer_capacity").unwrap(),
            64
        );
        assert_eq!(
            get_namespaced_usize(&config, "", "buffer_capacity").unwrap(),
            64
        );
    }
}
