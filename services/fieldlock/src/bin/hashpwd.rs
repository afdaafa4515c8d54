//! Operator bootstrap tool: hash a password with the production parameters.

use anyhow::{bail, Result};
use fieldlock::password::{Hasher, HasherConfig};

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(password) = args.next() else {
        bail!("usage: hashpwd <password>");
    };

    let hasher = Hasher::new(&HasherConfig::default())?;
    println!("{}", hasher.hash(&password)?);
    Ok(())
}
