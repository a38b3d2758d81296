use ntfs_parser::api::ROOT_RECORD;
use ntfs_parser::errors::{NtfsError, NtfsResult};
use ntfs_parser::mft::Mft;
use ntfs_parser::path::{full_path, PathCache, PathResolver};
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

struct Tree {
    docs: u64,
    sub: u64,
    a: u64,
    b: u64,
}

fn tree() -> (ImageBuilder, Tree) {
    let mut builder = ImageBuilder::new();
    let docs = builder.add_directory(ROOT_RECORD, "docs");
    let a = builder.add_file(docs, "a.txt", b"a");
    let sub = builder.add_directory(docs, "Sub Directory");
    builder.add_short_name(docs, sub, "SUBDIR~1");
    let b = builder.add_file(sub, "b.txt", b"b");
    (builder, Tree { docs, sub, a, b })
}

fn open(device: MemoryDevice) -> NtfsResult<Mft<MemoryDevice>> {
    init_tracing();
    Mft::new(Volume::new(device)?)
}

#[test]
fn resolves_nested_paths() -> NtfsResult<()> {
    let (builder, tree) = tree();
    let mut mft = open(builder.device())?;
    let resolver = PathResolver::new();

    assert_eq!(resolver.resolve(&mut mft, "C:\\docs")?.number(), tree.docs);
    assert_eq!(resolver.resolve(&mut mft, "C:\\docs\\a.txt")?.number(), tree.a);
    assert_eq!(
        resolver.resolve(&mut mft, "c:\\DOCS\\sub directory\\B.TXT")?.number(),
        tree.b
    );
    // The DOS alias resolves to the same record.
    assert_eq!(resolver.resolve(&mut mft, "C:\\docs\\SUBDIR~1")?.number(), tree.sub);
    assert_eq!(resolver.resolve(&mut mft, "C:\\\\docs\\\\a.txt\\")?.number(), tree.a);
    assert_eq!(resolver.resolve(&mut mft, "C:")?.number(), ROOT_RECORD);

    Ok(())
}

#[test]
fn file_in_the_middle_of_a_path() -> NtfsResult<()> {
    let (builder, _) = tree();
    let mut mft = open(builder.device())?;

    assert!(matches!(
        PathResolver::new().resolve(&mut mft, "C:\\docs\\a.txt\\more"),
        Err(NtfsError::BadPath(_))
    ));
    Ok(())
}

#[test]
fn missing_component() -> NtfsResult<()> {
    let (builder, _) = tree();
    let mut mft = open(builder.device())?;
    let resolver = PathResolver::new();

    assert!(matches!(
        resolver.resolve(&mut mft, "C:\\docs\\c.txt"),
        Err(NtfsError::RecordNotFound(_))
    ));
    assert!(matches!(
        resolver.resolve(&mut mft, "C:\\nowhere\\a.txt"),
        Err(NtfsError::RecordNotFound(_))
    ));
    Ok(())
}

#[test]
fn volume_token_must_name_the_volume() -> NtfsResult<()> {
    let (builder, tree) = tree();
    let mut mft = open(MemoryDevice::with_letter(builder.build(), 'D'))?;
    let resolver = PathResolver::new();

    assert_eq!(resolver.resolve(&mut mft, "d:\\docs")?.number(), tree.docs);
    assert_eq!(resolver.resolve(&mut mft, "D\\docs")?.number(), tree.docs);
    for path in ["C:\\docs", "docs\\a.txt", "DD:\\docs", "\\"] {
        assert!(
            matches!(resolver.resolve(&mut mft, path), Err(NtfsError::BadPath(_))),
            "{} should be rejected",
            path
        );
    }
    Ok(())
}

#[test]
fn variables_name_the_start_of_a_path() -> NtfsResult<()> {
    let (builder, tree) = tree();
    let mut mft = open(builder.device())?;
    let resolver = PathResolver::with_lookup(|name| match name {
        "DOCS" => Some("C:\\docs".to_string()),
        "DEEP" => Some("%DOCS%\\Sub Directory".to_string()),
        _ => None,
    });

    assert_eq!(resolver.resolve(&mut mft, "%DOCS%\\a.txt")?.number(), tree.a);
    assert_eq!(resolver.resolve(&mut mft, "%DEEP%\\b.txt")?.number(), tree.b);
    assert!(matches!(
        resolver.resolve(&mut mft, "%UNSET%\\a.txt"),
        Err(NtfsError::BadPath(_))
    ));
    Ok(())
}

#[test]
fn full_path_walks_up_to_the_root() -> NtfsResult<()> {
    let (builder, tree) = tree();
    let mut mft = open(MemoryDevice::with_letter(builder.build(), 'D'))?;
    let mut cache = PathCache::new();

    let file = mft.read_record(tree.b)?;
    assert_eq!(
        full_path(&mut mft, &file, &mut cache)?,
        "D:\\docs\\Sub Directory\\b.txt"
    );
    assert_eq!(cache.get(&tree.sub), Some(&(tree.docs, "Sub Directory".to_string())));
    assert_eq!(cache.get(&tree.docs), Some(&(ROOT_RECORD, "docs".to_string())));

    let file = mft.read_record(tree.a)?;
    assert_eq!(full_path(&mut mft, &file, &mut cache)?, "D:\\docs\\a.txt");

    let root = mft.read_record(ROOT_RECORD)?;
    assert_eq!(full_path(&mut mft, &root, &mut cache)?, "D:\\");

    Ok(())
}

#[test]
fn full_path_round_trips_through_resolve() -> NtfsResult<()> {
    let (builder, tree) = tree();
    let mut mft = open(MemoryDevice::with_letter(builder.build(), 'E'))?;

    let file = mft.read_record(tree.b)?;
    let path = full_path(&mut mft, &file, &mut PathCache::new())?;
    assert_eq!(PathResolver::new().resolve(&mut mft, &path)?.number(), tree.b);

    Ok(())
}

#[test]
fn full_path_without_a_drive_letter() -> NtfsResult<()> {
    let (builder, tree) = tree();
    let mut mft = open(builder.device())?;

    let file = mft.read_record(tree.a)?;
    assert_eq!(full_path(&mut mft, &file, &mut PathCache::new())?, "\\docs\\a.txt");
    Ok(())
}
