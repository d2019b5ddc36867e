use gateway_cd::crd::canary::CanaryDeployment;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    // Print the CanaryDeployment CRD manifest.
    // Use: cargo run --bin gen-crd | python3 -c "import sys,json,yaml; print(yaml.dump(json.load(sys.stdin), default_flow_style=False))"
    // to convert to YAML.
    let crd = CanaryDeployment::crd();
    println!("{}", serde_json::to_string_pretty(&crd)?);
    Ok(())
}
