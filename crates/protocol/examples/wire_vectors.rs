//! Print hex dumps of common messages for comparison with packet captures.
//!
//! Run with: cargo run --package adb-protocol --example wire_vectors

use adb_protocol::*;

fn main() {
    // Vector 1: host CNXN
    let cnxn = AdbMessage::new(
        Command::Cnxn,
        PROTOCOL_VERSION,
        DEFAULT_MAX_PAYLOAD as u32,
        b"host::rawadb\0".to_vec(),
    );
    print_vector("cnxn", &cnxn);

    // Vector 2: AUTH signature over a fixed token
    let token = [0x5au8; TOKEN_SIZE];
    let mut block = SHA1_DIGEST_INFO.to_vec();
    block.extend_from_slice(&token);
    let auth = AdbMessage::new(Command::Auth, AUTH_SIGNATURE, 0, block);
    print_vector("auth_signature_block", &auth);

    // Vector 3: OPEN for a shell command
    let open = AdbMessage::new(Command::Open, 1, 0, b"shell:ls -l\0".to_vec());
    print_vector("open_shell", &open);

    // Vector 4: OKAY credit
    let okay = AdbMessage::new(Command::Okay, 1, 1001, Vec::new());
    print_vector("okay", &okay);

    // Vector 5: WRTE carrying a sync STAT request
    let path = b"/sdcard";
    let mut stat = SyncId::Stat.as_bytes().to_vec();
    stat.extend_from_slice(&(path.len() as u32).to_le_bytes());
    stat.extend_from_slice(path);
    let wrte = AdbMessage::new(Command::Wrte, 1, 1001, stat);
    print_vector("wrte_sync_stat", &wrte);

    // Vector 6: CLSE
    let clse = AdbMessage::new(Command::Clse, 1, 1001, Vec::new());
    print_vector("clse", &clse);
}

fn print_vector(name: &str, message: &AdbMessage) {
    let bytes = message.encode();
    println!("{} ({} bytes):", name, bytes.len());
    for line in bytes.chunks(16) {
        let hex: Vec<String> = line.iter().map(|b| format!("{:02x}", b)).collect();
        println!("  {}", hex.join(" "));
    }
}
