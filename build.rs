fn main() {
    // Language bundles under registry/ are embedded with include_dir!, so any
    // change there must rebuild the crate
    println!("cargo:rerun-if-changed=registry/");
}
