//! Build script for the Custard gateway.
//!
//! Recompiles when migration files change so the `SQLx` `migrate!()` macro
//! picks up new migrations.

fn main() {
    println!("cargo:rerun-if-changed=migrations");
}
