use kube::CustomResourceExt;

fn main() {
    println!("---");
    print!(
        "{}",
        serde_yaml::to_string(&mongokube_operator::resources::Mk::crd()).unwrap()
    );
}
