//! Generates the Overlay CRD manifest on stdout.

use kube::CustomResourceExt;

fn main() {
    let crd = api::v1::Overlay::crd();
    print!("{}", serde_yaml::to_string(&crd).expect("serialize CRD"));
}
