use std::io::Write;

/// Initialize the global logger.
///
/// Log level is taken from `RUST_LOG` (daemon default is `info`), records are
/// written to stderr so the wire protocol on stdout/sockets stays clean.
pub fn init() {
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(env)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                buf.timestamp(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .target(env_logger::Target::Stderr)
        .init();
}
