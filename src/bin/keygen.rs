//! RSA-4096 Keypair Generation Tool for Node Bootstrap
//!
//! Generates a fresh RSA-4096 keypair for a named node and writes
//! PKCS#8/SubjectPublicKeyInfo PEM files to the output directory.
//!
//! Usage:
//!   cargo run --bin keygen -- --name alpha_1 --output ./keys/

use clap::Parser;
use sainya_fabric::crypto::Keypair;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keygen", version, about = "Fabric RSA-4096 keypair generator")]
struct Args {
    /// Node name (used as the output file prefix)
    #[arg(short, long)]
    name: String,

    /// Output directory for the PEM files
    #[arg(short, long, default_value = ".")]
    output: PathBuf,
}

fn main() {
    let args = Args::parse();

    println!("generating RSA-{} keypair for: {}", sainya_fabric::crypto::RSA_KEY_BITS, args.name);

    let keypair = Keypair::generate().expect("key generation failed");
    let private_pem = keypair.private_key_pem().expect("failed to encode private key");
    let public_pem = keypair.public_key_pem().expect("failed to encode public key");

    fs::create_dir_all(&args.output).expect("failed to create output directory");

    let private_path = args.output.join(format!("{}_private.pem", args.name));
    fs::write(&private_path, &private_pem).expect("failed to write private key");
    println!("private key (PKCS#8): {}", private_path.display());

    let public_path = args.output.join(format!("{}_public.pem", args.name));
    fs::write(&public_path, &public_pem).expect("failed to write public key");
    println!("public key (SubjectPublicKeyInfo): {}", public_path.display());

    // Sanity check: sign and verify a test message before handing the keys off.
    let test_message = b"node bootstrap self-test";
    let signature = keypair.sign(test_message).expect("self-test signing failed");
    if sainya_fabric::crypto::verify(test_message, &signature, keypair.public_key()) {
        println!("self-test signature: verified");
    } else {
        eprintln!("self-test signature: FAILED to verify");
        std::process::exit(1);
    }

    println!();
    println!("keep {} off version control; load it at node startup.", private_path.display());
}
