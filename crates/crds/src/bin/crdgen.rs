//! Prints the SriovFecNodeConfig CRD manifest as YAML.

use crds::SriovFecNodeConfig;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&SriovFecNodeConfig::crd())?);
    Ok(())
}
