#[cfg(windows)]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    use ntfs_parser::device::open_volume;
    use ntfs_parser::journal::{reason_to_string, ChangeJournalReader, JournalOptions, NextUsn};

    // Raw volume access needs an elevated process.
    let mut device = open_volume('C')?;

    // With `JournalOptions` you can choose where to start reading from
    // (beginning, end, specific USN), the reason mask and the buffer size.
    let options = JournalOptions {
        // Normally you'd use the default NextUsn::Next to only see new changes.
        next_usn: NextUsn::First,
        ..Default::default()
    };
    let mut journal = ChangeJournalReader::new(&mut device, options)?;

    let events = journal.read(&mut device)?;
    println!("Found {} journal events", events.len());

    for event in events.iter().take(10) {
        println!(
            "USN: {}, Time: {}, Record: {}, Parent: {}, Name: {}, Reason: {}",
            event.usn,
            event.time(),
            event.file_reference,
            event.parent_reference,
            event.name,
            reason_to_string(event.reason)
        );
    }

    Ok(())
}

#[cfg(not(windows))]
fn main() {
    eprintln!("The change journal is only reachable through a live Windows volume.");
}
