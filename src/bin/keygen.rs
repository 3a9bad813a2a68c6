//! Prints a fresh X25519 keypair for the `[auth]` config section.
//!
//! The secret goes into the worker's `auth.secret_key`; the public key is
//! what clients pin, or what a worker lists in `auth.authorized_keys`.

use obelisk::auth::Keypair;

fn main() {
    let keypair = Keypair::generate();

    println!("# keep secret; paste into [auth] secret_key on the owning side");
    println!("secret_key = \"{}\"", keypair.secret_hex());
    println!("# share freely; pin on clients or list in authorized_keys");
    println!("public_key = \"{}\"", keypair.public().to_hex());
}
