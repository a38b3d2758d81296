use std::collections::HashSet;

use ntfs_parser::api::{FIRST_USER_RECORD, ROOT_RECORD};
use ntfs_parser::attribute::{DataRun, DataStream};
use ntfs_parser::cancel::StopSignal;
use ntfs_parser::errors::{NtfsError, NtfsResult};
use ntfs_parser::mft::Mft;
use ntfs_parser::test_utils::{ImageBuilder, MemoryDevice, CLUSTER_SIZE, MFT_RECORDS};
use ntfs_parser::volume::Volume;
use tracing_subscriber::FmtSubscriber;

fn init_tracing() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(tracing::Level::TRACE)
        .without_time()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

fn open(builder: ImageBuilder) -> NtfsResult<Mft<MemoryDevice>> {
    init_tracing();
    Mft::new(Volume::new(builder.device())?)
}

#[test]
fn mft_creation() -> NtfsResult<()> {
    let mut mft = open(ImageBuilder::new())?;

    assert_eq!(mft.record_count(), MFT_RECORDS);
    assert_eq!(mft.record_size(), 1024);
    assert!(mft.read_record(ROOT_RECORD)?.is_directory());
    assert_eq!(mft.read_record(0)?.friendly_name()?, "$MFT");

    Ok(())
}

#[test]
fn record_past_the_end_is_not_found() -> NtfsResult<()> {
    let mut mft = open(ImageBuilder::new())?;

    assert!(matches!(
        mft.read_record(MFT_RECORDS),
        Err(NtfsError::RecordNotFound(_))
    ));
    assert!(matches!(
        mft.read_record(u64::MAX),
        Err(NtfsError::RecordNotFound(_))
    ));
    // Never written, so no FILE signature.
    assert!(matches!(
        mft.read_record(MFT_RECORDS - 1),
        Err(NtfsError::BadRecordHeader { .. })
    ));

    Ok(())
}

#[test]
fn resident_and_non_resident_content() -> NtfsResult<()> {
    let small = b"hello world".to_vec();
    let large = pattern(5000);

    let mut builder = ImageBuilder::new();
    let a = builder.add_file(ROOT_RECORD, "small.txt", &small);
    let b = builder.add_file(ROOT_RECORD, "large.bin", &large);
    let mut mft = open(builder)?;

    let file = mft.read_record(a)?;
    assert!(file.data_stream("")?.attribute().is_resident());
    assert_eq!(file.read_all(&mut mft.volume, "")?, small);
    assert_eq!(file.read(&mut mft.volume, "", 6, 5)?, b"world");

    let file = mft.read_record(b)?;
    assert!(!file.data_stream("")?.attribute().is_resident());
    assert_eq!(file.size("")?, 5000);
    assert_eq!(file.read_all(&mut mft.volume, "")?, large);
    // Unaligned window spanning a cluster boundary.
    assert_eq!(file.read(&mut mft.volume, "", 1000, 100)?, large[1000..1100]);

    Ok(())
}

#[test]
fn reads_past_the_size_are_out_of_bounds() -> NtfsResult<()> {
    let mut builder = ImageBuilder::new();
    let a = builder.add_file(ROOT_RECORD, "small.txt", b"0123456789");
    let b = builder.add_file(ROOT_RECORD, "large.bin", &pattern(3000));
    let mut mft = open(builder)?;

    let file = mft.read_record(a)?;
    assert!(matches!(
        file.read(&mut mft.volume, "", 5, 6),
        Err(NtfsError::OutOfBounds { offset: 5, length: 6, size: 10 })
    ));
    assert_eq!(file.read(&mut mft.volume, "", 10, 0)?, Vec::<u8>::new());

    let file = mft.read_record(b)?;
    assert!(matches!(
        file.read(&mut mft.volume, "", 2999, 2),
        Err(NtfsError::OutOfBounds { .. })
    ));
    assert!(matches!(
        file.read(&mut mft.volume, "", u64::MAX, 2),
        Err(NtfsError::OutOfBounds { .. })
    ));

    Ok(())
}

#[test]
fn fragmented_runs_with_negative_deltas() -> NtfsResult<()> {
    let content = pattern(9 * CLUSTER_SIZE as usize - 100);

    let mut builder = ImageBuilder::new();
    let number = builder.add_fragmented_file(ROOT_RECORD, "frag.bin", &content, 3);
    let mut mft = open(builder)?;

    let file = mft.read_record(number)?;
    let stream = file.data_stream("")?;
    let runs = stream.attribute().data_runs();
    assert_eq!(runs.len(), 3);

    let lcns: Vec<u64> = runs
        .iter()
        .map(|run| match run {
            DataRun::Data { lcn, .. } => *lcn,
            DataRun::Sparse { .. } => panic!("no sparse runs expected"),
        })
        .collect();
    assert!(lcns[0] > lcns[1] && lcns[1] > lcns[2]);

    let mut next = 0;
    for run in runs {
        assert_eq!(run.vcn(), next);
        next = run.end_vcn();
    }
    assert_eq!(next, 9);

    assert_eq!(stream.read(&mut mft.volume, 0, stream.size())?, content);
    Ok(())
}

#[test]
fn sparse_runs_read_as_zero_without_device_access() -> NtfsResult<()> {
    let head = pattern(2 * CLUSTER_SIZE as usize);

    let mut builder = ImageBuilder::new();
    let number = builder.add_sparse_file(ROOT_RECORD, "sparse.bin", &head, 3);
    let mut mft = open(builder)?;

    let file = mft.read_record(number)?;
    let stream = file.data_stream("")?;
    assert!(stream.attribute().is_sparse());
    assert_eq!(stream.size(), 5 * CLUSTER_SIZE);

    let (head_lcn, head_clusters) = match stream.attribute().data_runs()[0] {
        DataRun::Data { lcn, clusters, .. } => (lcn, clusters),
        DataRun::Sparse { .. } => panic!("first run must hold data"),
    };
    assert!(stream.attribute().data_runs()[1].is_sparse());

    mft.volume.device_mut().clear_reads();
    let offset = CLUSTER_SIZE + 512;
    let length = 2 * CLUSTER_SIZE;
    let window = stream.read(&mut mft.volume, offset, length)?;

    let mut reference = head.clone();
    reference.extend(vec![0u8; 3 * CLUSTER_SIZE as usize]);
    assert_eq!(window, reference[offset as usize..(offset + length) as usize]);

    let head_start = head_lcn * CLUSTER_SIZE;
    let head_end = head_start + head_clusters * CLUSTER_SIZE;
    for (read_offset, read_length) in mft.volume.device().reads() {
        assert!(*read_offset >= head_start);
        assert!(*read_offset + *read_length as u64 <= head_end);
    }

    mft.volume.device_mut().clear_reads();
    let tail = stream.read(&mut mft.volume, 3 * CLUSTER_SIZE, 2 * CLUSTER_SIZE)?;
    assert!(tail.iter().all(|b| *b == 0));
    assert!(mft.volume.device().reads().is_empty());

    Ok(())
}

#[test]
fn bytes_past_initialized_size_read_as_zero() -> NtfsResult<()> {
    let content = pattern(3000);

    let mut builder = ImageBuilder::new();
    let number = builder.add_preallocated_file(ROOT_RECORD, "prealloc.bin", &content, 1500);
    let mut mft = open(builder)?;

    let file = mft.read_record(number)?;
    let data = file.read_all(&mut mft.volume, "")?;
    assert_eq!(data.len(), 3000);
    assert_eq!(data[..1500], content[..1500]);
    assert!(data[1500..].iter().all(|b| *b == 0));

    Ok(())
}

#[test]
fn streams_split_across_extension_records() -> NtfsResult<()> {
    let main = pattern(5 * CLUSTER_SIZE as usize - 24);
    let ads = pattern(3000);

    let mut builder = ImageBuilder::new();
    let number = builder.add_empty_file(ROOT_RECORD, "split.bin");
    let first = builder.add_extension_stream(number, "", &main);
    let second = builder.add_extension_stream(number, "ads", &ads);
    builder.add_stream(number, "small", b"tiny");
    let mut mft = open(builder)?;

    let file = mft.read_record(number)?;
    let extensions: HashSet<u64> = file.extensions().iter().map(|e| e.number()).collect();
    assert_eq!(extensions, HashSet::from([first, second]));

    assert_eq!(file.read_all(&mut mft.volume, "")?, main);
    assert_eq!(file.read_all(&mut mft.volume, "ads")?, ads);
    assert_eq!(file.main_size()?, main.len() as u64);
    assert_eq!(file.total_size()?, (main.len() + ads.len() + 4) as u64);

    let mut streams = file.list_streams()?;
    streams.sort();
    assert_eq!(streams, vec!["ads", "small"]);

    Ok(())
}

#[test]
fn typed_lookup_on_a_file_ignores_extension_records() -> NtfsResult<()> {
    let main = pattern(4 * CLUSTER_SIZE as usize);

    let mut builder = ImageBuilder::new();
    let number = builder.add_empty_file(ROOT_RECORD, "split.bin");
    builder.add_extension_stream(number, "", &main);
    let mut mft = open(builder)?;

    let file = mft.read_record(number)?;

    // Only the piece stored in the primary record is visible here, while
    // `data_stream` merges the pieces of every record.
    let primary_only = file.find_attributes::<DataStream>(false)?;
    assert_eq!(primary_only.len(), 1);
    assert_eq!(primary_only[0].attribute().data_runs().len(), 1);
    assert_eq!(file.data_stream("")?.attribute().data_runs().len(), 2);
    assert!(primary_only[0].read(&mut mft.volume, 0, main.len() as u64).is_err());

    Ok(())
}

#[test]
fn iteration_skips_corrupted_and_extension_records() -> NtfsResult<()> {
    let mut builder = ImageBuilder::new();
    let good = builder.add_file(ROOT_RECORD, "good.txt", b"good");
    let bad = builder.add_file(ROOT_RECORD, "bad.txt", b"bad");
    let split = builder.add_empty_file(ROOT_RECORD, "split.bin");
    let extension = builder.add_extension_stream(split, "", &pattern(4000));
    builder.corrupt_record(bad);
    let mut mft = open(builder)?;

    assert!(matches!(
        mft.read_record(bad),
        Err(NtfsError::CorruptionError { .. })
    ));

    let mut visited = HashSet::new();
    let summary = mft.iterate_files(None, |_, file| {
        visited.insert(file.number());
        Ok(())
    })?;

    assert!(visited.contains(&good));
    assert!(visited.contains(&split));
    assert!(visited.contains(&ROOT_RECORD));
    assert!(!visited.contains(&bad));
    assert!(!visited.contains(&extension));
    assert_eq!(summary.visited, visited.len() as u64);
    assert!(summary.skipped > 0);
    assert!(!summary.stopped);

    Ok(())
}

#[test]
fn iteration_skips_records_the_callback_fails_on() -> NtfsResult<()> {
    let mut builder = ImageBuilder::new();
    let named = builder.add_file(ROOT_RECORD, "named.txt", b"x");
    let mut mft = open(builder)?;

    let mut names = Vec::new();
    let summary = mft.iterate_files(None, |_, file| {
        if file.number() < FIRST_USER_RECORD {
            return Err(NtfsError::NoName(file.number()));
        }
        names.push(file.friendly_name()?);
        Ok(())
    })?;

    assert_eq!(names, vec!["named.txt"]);
    assert_eq!(summary.visited, 1);
    assert!(mft.read_record(named).is_ok());

    Ok(())
}

#[test]
fn iteration_stops_on_request() -> NtfsResult<()> {
    let mut builder = ImageBuilder::new();
    for i in 0..5 {
        builder.add_file(ROOT_RECORD, &format!("f{}.txt", i), b"x");
    }
    let mut mft = open(builder)?;

    let stop = StopSignal::new();
    let remote = stop.clone();
    let summary = mft.iterate_files(Some(&stop), |_, file| {
        if file.number() == FIRST_USER_RECORD + 1 {
            remote.signal();
        }
        Ok(())
    })?;

    assert!(summary.stopped);
    assert!(!stop.is_requested());
    // 0, 3, 5, 16 and 17.
    assert_eq!(summary.visited, 5);

    let summary = mft.iterate_files(Some(&stop), |_, _| Ok(()))?;
    assert!(!summary.stopped);
    assert_eq!(summary.visited, 8);

    Ok(())
}

#[test]
fn deleted_files_keep_their_metadata() -> NtfsResult<()> {
    let mut builder = ImageBuilder::new();
    let number = builder.add_file(ROOT_RECORD, "gone.txt", b"still here");
    builder.mark_deleted(number);
    let mut mft = open(builder)?;

    let file = mft.read_record(number)?;
    assert!(file.is_deleted());
    assert_eq!(file.friendly_name()?, "gone.txt");
    assert_eq!(file.read_all(&mut mft.volume, "")?, b"still here");

    Ok(())
}

#[test]
fn long_name_wins_over_short_alias() -> NtfsResult<()> {
    let mut builder = ImageBuilder::new();
    let number = builder.add_file(ROOT_RECORD, "Quarterly Report.docx", b"x");
    builder.add_short_name(ROOT_RECORD, number, "QUARTE~1.DOC");
    let mut mft = open(builder)?;

    let file = mft.read_record(number)?;
    assert_eq!(file.file_names()?.len(), 2);
    assert_eq!(file.friendly_name()?, "Quarterly Report.docx");
    assert_eq!(file.parent_reference()?.record_number(), ROOT_RECORD);

    Ok(())
}
