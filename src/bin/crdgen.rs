use anyhow::Result;
use kube::CustomResourceExt;

use backup_operator::types::{Archive, Backup, Check, Prune, Restore, Schedule};

fn main() -> Result<()> {
    let documents = [
        serde_yaml::to_string(&Backup::crd())?,
        serde_yaml::to_string(&Check::crd())?,
        serde_yaml::to_string(&Prune::crd())?,
        serde_yaml::to_string(&Archive::crd())?,
        serde_yaml::to_string(&Restore::crd())?,
        serde_yaml::to_string(&Schedule::crd())?,
    ];
    println!("{}", documents.join("---\n"));
    Ok(())
}
