use ntfs_parser::api::ROOT_RECORD;
use ntfs_parser::errors::{NtfsError, NtfsResult};
use ntfs_parser::index::{find_in_directory, list_directory, DirEntry, DirectoryIndex};
use ntfs_parser::mft::Mft;
use ntfs_parser::test_utils::{ImageBuilder, MemoryDevice};
use ntfs_parser::volume::Volume;
use tracing_subscriber::FmtSubscriber;

fn init_tracing() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(tracing::Level::TRACE)
        .without_time()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn open(builder: ImageBuilder) -> NtfsResult<Mft<MemoryDevice>> {
    init_tracing();
    Mft::new(Volume::new(builder.device())?)
}

fn names(entries: &[DirEntry]) -> Vec<String> {
    let mut names: Vec<String> = entries
        .iter()
        .map(|entry| entry.file.friendly_name().unwrap())
        .collect();
    names.sort();
    names
}

const LETTERS: [&str; 7] = ["alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf"];

#[test]
fn small_directory_lives_in_the_root() -> NtfsResult<()> {
    let mut builder = ImageBuilder::new();
    let dir = builder.add_directory(ROOT_RECORD, "small");
    let a = builder.add_file(dir, "a.txt", b"a");
    let b = builder.add_file(dir, "b.txt", b"b");
    let mut mft = open(builder)?;

    let directory = mft.read_record(dir)?;
    let geometry = mft.volume.geometry;
    let index = DirectoryIndex::new(&directory, &geometry)?;
    assert!(index.root().entries.iter().all(|entry| !entry.has_child()));

    assert_eq!(index.lookup(&mut mft.volume, "a.txt")?.record_number(), a);
    assert_eq!(index.lookup(&mut mft.volume, "b.txt")?.record_number(), b);
    assert!(matches!(
        index.lookup(&mut mft.volume, "c.txt"),
        Err(NtfsError::RecordNotFound(_))
    ));

    Ok(())
}

#[test]
fn two_level_lookup() -> NtfsResult<()> {
    let mut builder = ImageBuilder::new();
    let dir = builder.add_directory(ROOT_RECORD, "big");
    let records: Vec<u64> = LETTERS
        .iter()
        .map(|name| builder.add_file(dir, name, name.as_bytes()))
        .collect();
    let mut mft = open(builder)?;

    let directory = mft.read_record(dir)?;
    let geometry = mft.volume.geometry;
    let index = DirectoryIndex::new(&directory, &geometry)?;

    // charlie and foxtrot separate the blocks; golf hangs off the terminator.
    let root_names: Vec<Option<&str>> = index.root().entries.iter().map(|e| e.name()).collect();
    assert_eq!(root_names, vec![Some("charlie"), Some("foxtrot"), None]);
    assert!(index.root().entries.iter().all(|entry| entry.has_child()));

    for (name, record) in LETTERS.iter().zip(&records) {
        assert_eq!(index.lookup(&mut mft.volume, name)?.record_number(), *record);
    }
    assert!(matches!(
        index.lookup(&mut mft.volume, "hotel"),
        Err(NtfsError::RecordNotFound(_))
    ));

    let entries = index.entries(&mut mft.volume)?;
    let listed: Vec<&str> = entries.iter().filter_map(|e| e.name()).collect();
    assert_eq!(listed, LETTERS);

    Ok(())
}

#[test]
fn index_blocks_smaller_than_a_cluster() -> NtfsResult<()> {
    for cluster_size in [2048, 4096] {
        let mut builder = ImageBuilder::with_geometry(cluster_size, 1024);
        let dir = builder.add_directory(ROOT_RECORD, "big");
        let records: Vec<u64> = LETTERS
            .iter()
            .map(|name| builder.add_file(dir, name, name.as_bytes()))
            .collect();
        let mut mft = open(builder)?;

        let geometry = mft.volume.geometry;
        assert_eq!(geometry.cluster_size, cluster_size);
        assert_eq!(geometry.index_record_size, 1024);

        let directory = mft.read_record(dir)?;
        let index = DirectoryIndex::new(&directory, &geometry)?;
        assert_eq!(index.root().block_size, 1024);

        // Child pointers count 512 byte units, two per block.
        let vcns: Vec<Option<u64>> = index.root().entries.iter().map(|e| e.child_vcn).collect();
        assert_eq!(vcns, vec![Some(0), Some(2), Some(4)]);

        for (name, record) in LETTERS.iter().zip(&records) {
            assert_eq!(index.lookup(&mut mft.volume, name)?.record_number(), *record);
        }

        let listing = list_directory(&mut mft, &directory, 0)?;
        assert_eq!(names(&listing), LETTERS);
    }

    Ok(())
}

#[test]
fn lookup_ignores_case() -> NtfsResult<()> {
    let mut builder = ImageBuilder::new();
    let dir = builder.add_directory(ROOT_RECORD, "Docs");
    let readme = builder.add_file(dir, "ReadMe.md", b"# hi");
    let mut mft = open(builder)?;

    let root = mft.read_record(ROOT_RECORD)?;
    let directory = find_in_directory(&mut mft, &root, "DOCS")?;
    assert_eq!(directory.number(), dir);

    let file = find_in_directory(&mut mft, &directory, "readme.MD")?;
    assert_eq!(file.number(), readme);
    assert!(matches!(
        find_in_directory(&mut mft, &directory, "readme.m"),
        Err(NtfsError::RecordNotFound(_))
    ));

    Ok(())
}

#[test]
fn files_have_no_index() -> NtfsResult<()> {
    let mut builder = ImageBuilder::new();
    let number = builder.add_file(ROOT_RECORD, "plain.txt", b"x");
    let mut mft = open(builder)?;

    let file = mft.read_record(number)?;
    let geometry = mft.volume.geometry;
    assert!(matches!(
        DirectoryIndex::new(&file, &geometry),
        Err(NtfsError::UnexpectedAction { .. })
    ));
    assert!(matches!(
        find_in_directory(&mut mft, &file, "anything"),
        Err(NtfsError::UnexpectedAction { .. })
    ));

    Ok(())
}

#[test]
fn cyclic_index_is_corruption() -> NtfsResult<()> {
    let mut builder = ImageBuilder::new();
    let dir = builder.add_cyclic_directory(ROOT_RECORD, "loop");
    let mut mft = open(builder)?;

    let directory = mft.read_record(dir)?;
    assert!(matches!(
        find_in_directory(&mut mft, &directory, "missing"),
        Err(NtfsError::CorruptionError { .. })
    ));
    assert!(matches!(
        list_directory(&mut mft, &directory, 0),
        Err(NtfsError::CorruptionError { .. })
    ));

    Ok(())
}

#[test]
fn listing_reports_each_record_once() -> NtfsResult<()> {
    let mut builder = ImageBuilder::new();
    let long = builder.add_file(ROOT_RECORD, "A Long File Name.txt", b"x");
    builder.add_short_name(ROOT_RECORD, long, "ALONGF~1.TXT");
    builder.add_file(ROOT_RECORD, "short.txt", b"y");
    let mut mft = open(builder)?;

    let root = mft.read_record(ROOT_RECORD)?;
    let listing = list_directory(&mut mft, &root, 0)?;

    // $MFT and $Volume are indexed in the root but never listed.
    assert_eq!(names(&listing), vec!["A Long File Name.txt", "short.txt"]);
    assert!(listing.iter().all(|entry| entry.children.is_empty()));

    Ok(())
}

#[test]
fn listing_depth() -> NtfsResult<()> {
    let mut builder = ImageBuilder::new();
    let docs = builder.add_directory(ROOT_RECORD, "docs");
    builder.add_file(docs, "a.txt", b"a");
    let sub = builder.add_directory(docs, "sub");
    builder.add_file(sub, "b.txt", b"b");
    for name in LETTERS {
        builder.add_file(sub, name, b"c");
    }
    let mut mft = open(builder)?;
    let root = mft.read_record(ROOT_RECORD)?;

    let flat = list_directory(&mut mft, &root, 0)?;
    assert_eq!(names(&flat), vec!["docs"]);
    assert!(flat[0].children.is_empty());

    let one = list_directory(&mut mft, &root, 1)?;
    assert_eq!(names(&one[0].children), vec!["a.txt", "sub"]);
    assert!(one[0].children.iter().all(|entry| entry.children.is_empty()));

    let two = list_directory(&mut mft, &root, 2)?;
    let sub_entry = two[0]
        .children
        .iter()
        .find(|entry| entry.file.number() == sub)
        .unwrap();
    let mut expected: Vec<String> = LETTERS.iter().map(|s| s.to_string()).collect();
    expected.push("b.txt".to_string());
    expected.sort();
    assert_eq!(names(&sub_entry.children), expected);

    Ok(())
}
