//! `nixos-operator crd`: print the CRD manifests for both kinds.

use anyhow::Result;
use kube::CustomResourceExt;

use crate::api::{Machine, NixosConfiguration};

pub fn run() -> Result<()> {
    print!("{}", serde_yaml::to_string(&Machine::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&NixosConfiguration::crd())?);
    Ok(())
}
