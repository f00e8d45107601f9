//! Print the driftwatch CustomResourceDefinitions as a multi-document YAML stream

use kube::CustomResourceExt;

use driftwatch::crd::{AppProject, Application};

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&Application::crd()?)?);
    println!("---");
    print!("{}", serde_yaml::to_string(&AppProject::crd())?);
    Ok(())
}
