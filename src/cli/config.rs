use std::fs;
use std::io::{self, Write};

use crate::config::generate::generate_starter_config;

/// `logmerge config init`: writes a starter config to
/// `~/.config/logmerge/config.yml` (creating its parent directory), or
/// prints it to stdout if `stdout` is set.
pub fn init(stdout: bool) -> io::Result<()> {
    let contents = generate_starter_config();

    if stdout {
        io::stdout().write_all(contents.as_bytes())?;
        return Ok(());
    }

    let path = dirs::home_dir()
        .map(|home| home.join(".config/logmerge/config.yml"))
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "could not determine home directory"))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, contents)?;
    println!("wrote starter config to {}", path.display());
    Ok(())
}
