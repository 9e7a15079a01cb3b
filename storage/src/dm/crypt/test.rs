// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

extern crate alloc;
use alloc::{boxed::Box, string::String, sync::Arc, vec, vec::Vec};

use super::*;
use crate::blkdev::{
    BioEndIoStatus, BlkDevTable,
    test::{TestBlkDev, TestBlkDevCompletionMode, test_bio_data},
};
use crate::crypto::{
    CryptoError,
    symcipher::{SymBlockCipherAlg, SymBlockCipherKey, SymBlockCipherMode, SymBlockCipherModeEncryptionInstance},
};
use crate::utils_async::{
    sync_types::{Lock as _, SyncTypes},
    test::TestNopSyncTypes,
};

type TestLock<T> = <TestNopSyncTypes as SyncTypes>::Lock<T>;
type TestCryptTarget = CryptTarget<TestNopSyncTypes>;
type TestCompletions = Arc<TestLock<Vec<(Result<(), BlkDevIoError>, Vec<u8>)>>>;

const TEST_KEY: &str = "000102030405060708090a0b0c0d0e0f";
const TEST_GEOMETRY: DmTargetGeometry = DmTargetGeometry { begin: 0, len: 64 };

struct TestCryptEnv {
    dev: Arc<TestBlkDev>,
    devs: BlkDevTable,
    work_queue: Arc<CryptWorkQueue<TestNopSyncTypes>>,
    provider: SymCryptCipherProvider,
}

impl TestCryptEnv {
    fn new(sectors: u64, max_bio_bytes: Option<usize>) -> Self {
        let dev = Arc::new(TestBlkDev::new(sectors, max_bio_bytes));
        let mut devs = BlkDevTable::new();
        devs.insert("testdev", dev.clone()).unwrap();
        Self {
            dev,
            devs,
            work_queue: Arc::new(CryptWorkQueue::new()),
            provider: SymCryptCipherProvider::new(),
        }
    }

    fn env<'a>(&'a self, cipher_provider: &'a dyn CryptCipherProvider) -> CryptTargetEnv<'a, TestNopSyncTypes> {
        let mut env = CryptTargetEnv::new(&self.devs, cipher_provider, self.work_queue.clone());
        env.min_ios = 16;
        env.min_pool_pages = 4;
        env
    }

    fn ctr(&self, table: &str) -> Result<TestCryptTarget, DmError> {
        CryptTarget::ctr_from_table_line(TEST_GEOMETRY, table, &self.env(&self.provider))
    }

    fn target(&self, table: &str) -> TestCryptTarget {
        self.ctr(table).unwrap()
    }
}

fn test_bio(
    direction: BioDirection,
    sector: u64,
    data: &[u8],
    segment_len: usize,
    completions: &TestCompletions,
) -> blkdev::Bio {
    let segments = data
        .chunks(segment_len)
        .map(|chunk| {
            let mut page = vec![0u8; PAGE_SIZE].into_boxed_slice();
            page[..chunk.len()].copy_from_slice(chunk);
            BioSegment::new(page, 0, chunk.len())
        })
        .collect();
    let mut bio = blkdev::Bio::new(direction, sector, segments);
    let completions = completions.clone();
    bio.set_end_io(Box::new(
        move |bio: &mut blkdev::Bio, _bytes_done: usize, result: Result<(), BlkDevIoError>| {
            completions.lock().push((result, test_bio_data(bio)));
            BioEndIoStatus::Completed
        },
    ));
    bio
}

fn test_completions() -> TestCompletions {
    Arc::new(TestLock::from(Vec::new()))
}

fn test_map(target: &TestCryptTarget, bio: blkdev::Bio) -> Result<(), DmError> {
    target.map(bio).map_err(|(_, e)| e)
}

fn test_data(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Write `data` and read it back through `target`, returning the read data.
fn test_write_read(
    env: &TestCryptEnv,
    target: &TestCryptTarget,
    sector: u64,
    data: &[u8],
    segment_len: usize,
) -> Vec<u8> {
    let completions = test_completions();
    test_map(
        target,
        test_bio(BioDirection::Write, sector, data, segment_len, &completions),
    )
    .unwrap();
    assert_eq!(completions.lock().pop().unwrap().0, Ok(()));

    let zeroes = vec![0u8; data.len()];
    test_map(
        target,
        test_bio(BioDirection::Read, sector, &zeroes, segment_len, &completions),
    )
    .unwrap();
    env.work_queue.process_pending();
    let mut completions = completions.lock();
    assert_eq!(completions.len(), 1);
    let (result, read) = completions.pop().unwrap();
    assert_eq!(result, Ok(()));
    read
}

struct TestRecordingCipher {
    ivs: Arc<TestLock<Vec<Vec<u8>>>>,
    block: bool,
}

impl CryptCipher for TestRecordingCipher {
    fn name(&self) -> &str {
        "test"
    }

    fn is_block_cipher(&self) -> bool {
        self.block
    }

    fn supports_iv(&self) -> bool {
        true
    }

    fn iv_size(&self) -> usize {
        16
    }

    fn block_size(&self) -> usize {
        16
    }

    fn set_key(&mut self, _key: &[u8]) -> Result<(), CryptoError> {
        Ok(())
    }

    fn encrypt_in_place(&self, data: &mut [u8], iv: &[u8]) -> Result<(), CryptoError> {
        self.ivs.lock().push(iv.to_vec());
        data.iter_mut().for_each(|b| *b ^= 0x5a);
        Ok(())
    }

    fn decrypt_in_place(&self, data: &mut [u8], iv: &[u8]) -> Result<(), CryptoError> {
        self.encrypt_in_place(data, iv)
    }
}

struct TestCipherProvider {
    ivs: Arc<TestLock<Vec<Vec<u8>>>>,
    block: bool,
}

impl TestCipherProvider {
    fn new(block: bool) -> Self {
        Self {
            ivs: Arc::new(TestLock::from(Vec::new())),
            block,
        }
    }
}

impl CryptCipherProvider for TestCipherProvider {
    fn alloc_cipher(&self, name: &str, _mode: CryptChainMode) -> Result<Box<dyn CryptCipher>, DmError> {
        if name != "test" {
            return Err(DmError::InvalidArgument(DmInvalidArgument::CipherUnavailable));
        }
        Ok(Box::new(TestRecordingCipher {
            ivs: self.ivs.clone(),
            block: self.block,
        }))
    }
}

#[test]
fn test_crypt_plain_iv_per_sector() {
    let env = TestCryptEnv::new(64, None);
    let provider = TestCipherProvider::new(true);
    let target = CryptTarget::ctr_from_table_line(
        TEST_GEOMETRY,
        "test-plain 00000000000000000000000000000000 0 testdev 0",
        &env.env(&provider),
    )
    .unwrap();
    assert_eq!(target.iv_size(), 16);

    let completions = test_completions();
    let data = test_data(3 * SECTOR_SIZE, 1);
    test_map(
        &target,
        test_bio(BioDirection::Write, 10, &data, PAGE_SIZE, &completions),
    )
    .unwrap();
    assert_eq!(completions.lock().len(), 1);

    let ivs = provider.ivs.lock().clone();
    assert_eq!(ivs.len(), 3);
    for (i, iv) in ivs.iter().enumerate() {
        assert_eq!(iv[..4], (10 + i as u32).to_le_bytes());
        assert!(iv[4..].iter().all(|b| *b == 0));
    }
}

#[test]
fn test_crypt_aes_plain_ciphertext() {
    let env = TestCryptEnv::new(64, None);
    let target = env.target("aes-plain 00000000000000000000000000000000 0 testdev 0");
    let data = test_data(3 * SECTOR_SIZE, 2);

    let completions = test_completions();
    test_map(
        &target,
        test_bio(BioDirection::Write, 10, &data, PAGE_SIZE, &completions),
    )
    .unwrap();
    let first = env.dev.read_raw(10, data.len());

    let alg = SymBlockCipherAlg::lookup("aes", 16).unwrap();
    let key = SymBlockCipherKey::try_from((alg, &[0u8; 16][..])).unwrap();
    let encrypt = SymBlockCipherModeEncryptionInstance::new(SymBlockCipherMode::Cbc, &alg, &key).unwrap();
    for (i, sector) in data.chunks(SECTOR_SIZE).enumerate() {
        let mut iv = [0u8; 16];
        crypt_iv_plain(&mut iv, 10 + i as u64);
        let mut expected = sector.to_vec();
        encrypt.encrypt_in_place(&iv, &mut expected).unwrap();
        assert_eq!(first[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE], expected[..]);
    }

    // Deterministic for a given sector.
    test_map(
        &target,
        test_bio(BioDirection::Write, 10, &data, PAGE_SIZE, &completions),
    )
    .unwrap();
    assert_eq!(env.dev.read_raw(10, data.len()), first);
    assert_eq!(completions.lock().len(), 2);
}

#[test]
fn test_crypt_round_trip() {
    for mode in ["plain", "ecb"] {
        for max_bio_bytes in [None, Some(SECTOR_SIZE), Some(3 * SECTOR_SIZE), Some(2 * SECTOR_SIZE + 100)] {
            let env = TestCryptEnv::new(128, max_bio_bytes);
            let table = alloc::format!("aes-{} {} 5 testdev 16", mode, TEST_KEY);
            let target = CryptTarget::ctr_from_table_line(
                DmTargetGeometry { begin: 8, len: 64 },
                &table,
                &env.env(&env.provider),
            )
            .unwrap();

            let data = test_data(8 * SECTOR_SIZE, 3);
            let read = test_write_read(&env, &target, 12, &data, SECTOR_SIZE);
            assert_eq!(read, data);

            // Target sector 12 maps to 16 + 12 - 8 on the device.
            let raw = env.dev.read_raw(20, data.len());
            assert_ne!(raw, data);
            assert!(env.dev.submissions().iter().all(|s| s.sector >= 20));
            assert_eq!(target.pages_in_use(), 0);
            assert_eq!(target.ios_in_flight(), 0);
        }
    }
}

#[test]
fn test_crypt_write_fragments() {
    let env = TestCryptEnv::new(64, Some(3 * SECTOR_SIZE));
    let target = env.target(&alloc::format!("aes-plain {} 0 testdev 0", TEST_KEY));
    let data = test_data(8 * SECTOR_SIZE, 4);
    let read = test_write_read(&env, &target, 0, &data, SECTOR_SIZE);
    assert_eq!(read, data);

    let submissions = env.dev.submissions();
    let writes: Vec<_> = submissions
        .iter()
        .filter(|s| s.direction == BioDirection::Write)
        .map(|s| (s.sector, s.size))
        .collect();
    assert_eq!(
        writes,
        [(0, 3 * SECTOR_SIZE), (3, 3 * SECTOR_SIZE), (6, 2 * SECTOR_SIZE)]
    );
    let reads = submissions.iter().filter(|s| s.direction == BioDirection::Read).count();
    assert_eq!(reads, 3);
}

/// Complete the device's deferred requests in `order`, given as indices in
/// order of submission, and check the original request completes only with
/// the last one. Queued decryptions get run after each completion if
/// `interleave` is set, otherwise only at the end.
fn test_complete_in_order(
    env: &TestCryptEnv,
    order: &[usize],
    interleave: bool,
    completions: &TestCompletions,
) {
    let mut deferred: Vec<usize> = (0..order.len()).collect();
    for index in order {
        assert!(completions.lock().is_empty());
        let pos = deferred.iter().position(|i| i == index).unwrap();
        deferred.remove(pos);
        env.dev.complete_deferred(pos);
        if interleave {
            env.work_queue.process_pending();
        }
    }
    env.work_queue.process_pending();
    assert_eq!(completions.lock().len(), 1);
}

#[test]
fn test_crypt_completion_exactly_once() {
    let env = TestCryptEnv::new(64, Some(SECTOR_SIZE));
    let target = env.target(&alloc::format!("aes-plain {} 0 testdev 0", TEST_KEY));
    env.dev.set_completion_mode(TestBlkDevCompletionMode::Deferred);

    let mut orders: Vec<Vec<usize>> = (0..4)
        .map(|r| (r..4).chain(0..r).collect())
        .collect();
    orders.push(vec![3, 2, 1, 0]);
    orders.push(vec![1, 3, 0, 2]);
    orders.push(vec![2, 0, 3, 1]);

    for (seed, order) in orders.iter().enumerate() {
        for interleave in [false, true] {
            let data = test_data(4 * SECTOR_SIZE, seed as u8);

            let completions = test_completions();
            test_map(
                &target,
                test_bio(BioDirection::Write, 4, &data, SECTOR_SIZE, &completions),
            )
            .unwrap();
            assert_eq!(env.dev.deferred_count(), 4);
            test_complete_in_order(&env, order, interleave, &completions);
            assert_eq!(completions.lock().pop().unwrap().0, Ok(()));
            assert_eq!(target.pages_in_use(), 0);

            let zeroes = vec![0u8; data.len()];
            test_map(
                &target,
                test_bio(BioDirection::Read, 4, &zeroes, SECTOR_SIZE, &completions),
            )
            .unwrap();
            assert_eq!(env.dev.deferred_count(), 4);
            test_complete_in_order(&env, order, interleave, &completions);
            let (result, read) = completions.lock().pop().unwrap();
            assert_eq!(result, Ok(()));
            assert_eq!(read, data);
            assert!(env.work_queue.is_empty());
            assert_eq!(target.ios_in_flight(), 0);
        }
    }
}

#[test]
fn test_crypt_write_segment_larger_than_fragment() {
    let env = TestCryptEnv::new(64, Some(3 * SECTOR_SIZE));
    let target = env.target(&alloc::format!("aes-plain {} 0 testdev 0", TEST_KEY));
    let data = test_data(PAGE_SIZE, 12);

    let completions = test_completions();
    test_map(
        &target,
        test_bio(BioDirection::Write, 2, &data, PAGE_SIZE, &completions),
    )
    .unwrap();
    assert_eq!(completions.lock().pop().unwrap().0, Ok(()));
    let writes: Vec<_> = env
        .dev
        .submissions()
        .iter()
        .map(|s| (s.sector, s.size))
        .collect();
    assert_eq!(
        writes,
        [(2, 3 * SECTOR_SIZE), (5, 3 * SECTOR_SIZE), (8, 2 * SECTOR_SIZE)]
    );
    assert_eq!(target.pages_in_use(), 0);

    // Reads are split on segment boundaries only.
    let zeroes = vec![0u8; PAGE_SIZE];
    let bio = test_bio(BioDirection::Read, 2, &zeroes, PAGE_SIZE, &completions);
    assert_eq!(
        test_map(&target, bio),
        Err(DmError::IoError(BlkDevIoError::OperationNotSupported))
    );
    test_map(
        &target,
        test_bio(BioDirection::Read, 2, &zeroes, SECTOR_SIZE, &completions),
    )
    .unwrap();
    env.work_queue.process_pending();
    let (result, read) = completions.lock().pop().unwrap();
    assert_eq!(result, Ok(()));
    assert_eq!(read, data);
}

#[test]
fn test_crypt_sector_overflow() {
    let env = TestCryptEnv::new(64, None);
    let target = env.target(&alloc::format!("aes-plain {} 0 testdev {}", TEST_KEY, u64::MAX - 2));
    let data = test_data(4 * SECTOR_SIZE, 13);
    let completions = test_completions();
    assert_eq!(
        test_map(
            &target,
            test_bio(BioDirection::Write, 0, &data, SECTOR_SIZE, &completions),
        ),
        Err(DmError::IoError(BlkDevIoError::SectorOutOfRange))
    );

    let target = CryptTarget::ctr_from_table_line(
        DmTargetGeometry { begin: 0, len: u64::MAX },
        &alloc::format!("aes-plain {} 0 testdev 0", TEST_KEY),
        &env.env(&env.provider),
    )
    .unwrap();
    assert_eq!(
        test_map(
            &target,
            test_bio(BioDirection::Read, u64::MAX - 1, &data, SECTOR_SIZE, &completions),
        ),
        Err(DmError::IoError(BlkDevIoError::SectorOutOfRange))
    );
    assert!(completions.lock().is_empty());
    assert!(env.dev.submissions().is_empty());
    assert_eq!(target.ios_in_flight(), 0);
}

#[test]
fn test_crypt_chunked_completion() {
    let env = TestCryptEnv::new(64, None);
    let target = env.target(&alloc::format!("aes-ecb {} 0 testdev 0", TEST_KEY));
    env.dev.set_completion_mode(TestBlkDevCompletionMode::Chunked {
        chunk_bytes: SECTOR_SIZE,
    });
    let data = test_data(12 * SECTOR_SIZE, 6);
    let read = test_write_read(&env, &target, 1, &data, PAGE_SIZE);
    assert_eq!(read, data);
    assert_eq!(target.pages_in_use(), 0);
}

#[test]
fn test_crypt_last_error_wins() {
    let env = TestCryptEnv::new(6, Some(2 * SECTOR_SIZE));
    let target = env.target(&alloc::format!("aes-plain {} 0 testdev 0", TEST_KEY));
    env.dev.set_completion_mode(TestBlkDevCompletionMode::Deferred);
    env.dev.inject_error(0);
    let data = test_data(8 * SECTOR_SIZE, 7);

    // The last fragment is beyond the device's end.
    let completions = test_completions();
    test_map(
        &target,
        test_bio(BioDirection::Write, 0, &data, SECTOR_SIZE, &completions),
    )
    .unwrap();
    env.dev.complete_deferred(3);
    env.dev.complete_deferred(0);
    env.dev.complete_all_deferred();
    assert_eq!(completions.lock().pop().unwrap().0, Err(BlkDevIoError::IoFailure));

    test_map(
        &target,
        test_bio(BioDirection::Write, 0, &data, SECTOR_SIZE, &completions),
    )
    .unwrap();
    env.dev.complete_deferred(0);
    env.dev.complete_deferred(2);
    env.dev.complete_all_deferred();
    assert_eq!(
        completions.lock().pop().unwrap().0,
        Err(BlkDevIoError::SectorOutOfRange)
    );
    assert!(completions.lock().is_empty());
}

#[test]
fn test_crypt_read_error() {
    let env = TestCryptEnv::new(64, Some(2 * SECTOR_SIZE));
    let target = env.target(&alloc::format!("aes-plain {} 0 testdev 0", TEST_KEY));
    env.dev.inject_error(3);

    let completions = test_completions();
    let zeroes = vec![0u8; 4 * SECTOR_SIZE];
    test_map(
        &target,
        test_bio(BioDirection::Read, 0, &zeroes, SECTOR_SIZE, &completions),
    )
    .unwrap();
    // The first fragment's decryption still holds a reference.
    assert!(completions.lock().is_empty());
    assert_eq!(env.work_queue.process_pending(), 1);
    let completions = completions.lock();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].0, Err(BlkDevIoError::IoFailure));
    assert_eq!(completions[0].1.len(), zeroes.len());
}

#[test]
fn test_crypt_write_error() {
    let env = TestCryptEnv::new(64, None);
    let target = env.target(&alloc::format!("aes-plain {} 0 testdev 0", TEST_KEY));
    env.dev.inject_error(41);

    let completions = test_completions();
    let data = test_data(4 * SECTOR_SIZE, 8);
    test_map(
        &target,
        test_bio(BioDirection::Write, 40, &data, PAGE_SIZE, &completions),
    )
    .unwrap();
    assert_eq!(completions.lock().pop().unwrap().0, Err(BlkDevIoError::IoFailure));
    assert_eq!(target.pages_in_use(), 0);
}

#[test]
fn test_crypt_oom_no_fragment_dispatched() {
    let env = TestCryptEnv::new(64, None);
    let mut target_env = env.env(&env.provider);
    target_env.min_pool_pages = 0;
    target_env.max_pool_pages = Some(0);
    let target = CryptTarget::ctr_from_table_line(
        TEST_GEOMETRY,
        &alloc::format!("aes-plain {} 0 testdev 0", TEST_KEY),
        &target_env,
    )
    .unwrap();

    let completions = test_completions();
    let data = test_data(2 * SECTOR_SIZE, 9);
    let (bio, e) = match target.map(test_bio(BioDirection::Write, 0, &data, PAGE_SIZE, &completions)) {
        Ok(()) => panic!("map unexpectedly succeeded"),
        Err(err) => err,
    };
    assert_eq!(e, DmError::MemoryAllocationFailure);
    assert_eq!(test_bio_data(&bio), data);
    assert_eq!(env.dev.congestion_waits(), CRYPT_ALLOC_RETRIES);
    assert!(env.dev.submissions().is_empty());
    assert!(completions.lock().is_empty());
    assert_eq!(target.ios_in_flight(), 0);
}

#[test]
fn test_crypt_oom_after_dispatch() {
    let env = TestCryptEnv::new(64, None);
    env.dev.set_completion_mode(TestBlkDevCompletionMode::Deferred);
    let mut target_env = env.env(&env.provider);
    target_env.min_pool_pages = 1;
    target_env.max_pool_pages = Some(1);
    let target = CryptTarget::ctr_from_table_line(
        TEST_GEOMETRY,
        &alloc::format!("aes-plain {} 0 testdev 0", TEST_KEY),
        &target_env,
    )
    .unwrap();

    let completions = test_completions();
    let data = test_data(12 * SECTOR_SIZE, 10);
    test_map(
        &target,
        test_bio(BioDirection::Write, 0, &data, PAGE_SIZE, &completions),
    )
    .unwrap();
    assert_eq!(env.dev.deferred_count(), 1);
    assert_eq!(env.dev.congestion_waits(), 1 + CRYPT_ALLOC_RETRIES);
    assert!(completions.lock().is_empty());

    env.dev.complete_all_deferred();
    assert_eq!(
        completions.lock().pop().unwrap().0,
        Err(BlkDevIoError::MemoryAllocationFailure)
    );
    assert_eq!(target.pages_in_use(), 0);
}

#[test]
fn test_crypt_memory_pressure_partial_fragments() {
    let env = TestCryptEnv::new(64, None);
    let mut target_env = env.env(&env.provider);
    target_env.min_pool_pages = 1;
    target_env.max_pool_pages = Some(1);
    let target = CryptTarget::ctr_from_table_line(
        TEST_GEOMETRY,
        &alloc::format!("aes-plain {} 0 testdev 0", TEST_KEY),
        &target_env,
    )
    .unwrap();

    let data = test_data(20 * SECTOR_SIZE, 11);
    let read = test_write_read(&env, &target, 0, &data, PAGE_SIZE);
    assert_eq!(read, data);

    let writes: Vec<_> = env
        .dev
        .submissions()
        .iter()
        .filter(|s| s.direction == BioDirection::Write)
        .map(|s| (s.sector, s.size))
        .collect();
    assert_eq!(writes, [(0, PAGE_SIZE), (8, PAGE_SIZE), (16, 4 * SECTOR_SIZE)]);
    assert_eq!(env.dev.congestion_waits(), 2);
}

#[test]
fn test_crypt_io_pool_exhaustion() {
    let env = TestCryptEnv::new(64, None);
    env.dev.set_completion_mode(TestBlkDevCompletionMode::Deferred);
    let mut target_env = env.env(&env.provider);
    target_env.min_ios = 1;
    let target = CryptTarget::ctr_from_table_line(
        TEST_GEOMETRY,
        &alloc::format!("aes-plain {} 0 testdev 0", TEST_KEY),
        &target_env,
    )
    .unwrap();

    let completions = test_completions();
    let data = test_data(SECTOR_SIZE, 12);
    test_map(
        &target,
        test_bio(BioDirection::Write, 0, &data, PAGE_SIZE, &completions),
    )
    .unwrap();
    assert_eq!(
        test_map(
            &target,
            test_bio(BioDirection::Write, 1, &data, PAGE_SIZE, &completions)
        ),
        Err(DmError::MemoryAllocationFailure)
    );
    env.dev.complete_all_deferred();
    assert_eq!(completions.lock().len(), 1);
    test_map(
        &target,
        test_bio(BioDirection::Write, 1, &data, PAGE_SIZE, &completions),
    )
    .unwrap();
}

#[test]
fn test_crypt_map_rejects() {
    let env = TestCryptEnv::new(64, None);
    let target = CryptTarget::ctr_from_table_line(
        DmTargetGeometry { begin: 8, len: 16 },
        &alloc::format!("aes-plain {} 0 testdev 0", TEST_KEY),
        &env.env(&env.provider),
    )
    .unwrap();
    let completions = test_completions();
    let data = test_data(2 * SECTOR_SIZE, 13);

    let bio = test_bio(BioDirection::Write, 4, &data, PAGE_SIZE, &completions);
    assert_eq!(
        test_map(&target, bio),
        Err(DmError::IoError(BlkDevIoError::SectorOutOfRange))
    );
    let bio = test_bio(BioDirection::Write, 23, &data, PAGE_SIZE, &completions);
    assert_eq!(
        test_map(&target, bio),
        Err(DmError::IoError(BlkDevIoError::SectorOutOfRange))
    );
    let bio = test_bio(BioDirection::Read, 8, &data[..100], PAGE_SIZE, &completions);
    assert_eq!(
        test_map(&target, bio),
        Err(DmError::IoError(BlkDevIoError::OperationNotSupported))
    );
    assert!(completions.lock().is_empty());
    assert!(env.dev.submissions().is_empty());
}

#[test]
fn test_crypt_cipher_null() {
    let env = TestCryptEnv::new(64, None);
    let target = env.target("cipher_null-plain - 0 testdev 0");
    assert_eq!(target.iv_size(), 0);
    assert!(target.key().is_empty());

    let data = test_data(2 * SECTOR_SIZE, 14);
    let read = test_write_read(&env, &target, 3, &data, PAGE_SIZE);
    assert_eq!(read, data);
    assert_eq!(env.dev.read_raw(3, data.len()), data);
}

#[test]
fn test_crypt_status_round_trip() {
    let env = TestCryptEnv::new(64, None);
    for table in [
        "aes-plain 000102030405060708090a0b0c0d0e0f 7 testdev 3",
        "aes-ecb 000102030405060708090a0b0c0d0e0f1011121314151617 0 testdev 0",
        "aes 000102030405060708090A0B0C0D0E0F000102030405060708090a0b0c0d0e0f 1 testdev 2",
        "cipher_null-ecb - 0 testdev 0",
    ] {
        let target = env.target(table);
        assert_eq!(target.status(DmStatusType::Info).unwrap(), "");
        let status: String = target.status(DmStatusType::Table).unwrap();
        let rebuilt = env.target(&status);
        assert_eq!(rebuilt.status(DmStatusType::Table).unwrap(), status);
        assert_eq!(rebuilt.cipher_name(), target.cipher_name());
        assert_eq!(rebuilt.chain_mode(), target.chain_mode());
        assert_eq!(rebuilt.key(), target.key());
        assert_eq!(rebuilt.iv_offset(), target.iv_offset());
        assert_eq!(rebuilt.dev_name(), target.dev_name());
        assert_eq!(rebuilt.start(), target.start());
        rebuilt.dtr();
        target.dtr();
    }

    let target = env.target(&alloc::format!("aes {} 9 testdev 4", TEST_KEY));
    assert_eq!(
        target.status(DmStatusType::Table).unwrap(),
        alloc::format!("aes-plain {} 9 testdev 4", TEST_KEY)
    );
    let target = env.target("cipher_null-ecb - 0 testdev 0");
    assert_eq!(
        target.status(DmStatusType::Table).unwrap(),
        "cipher_null-ecb - 0 testdev 0"
    );
}

#[test]
fn test_crypt_ctr_errors() {
    let env = TestCryptEnv::new(64, None);
    let invalid = |reason| Some(DmError::InvalidArgument(reason));

    assert_eq!(
        env.ctr(&alloc::format!("aes-plain {} 0 testdev", TEST_KEY)).err(),
        invalid(DmInvalidArgument::ArgumentCount)
    );
    assert_eq!(
        env.ctr(&alloc::format!("aes-plain {} 0 testdev 0 1", TEST_KEY)).err(),
        invalid(DmInvalidArgument::ArgumentCount)
    );
    assert_eq!(
        env.ctr(&alloc::format!("aes-cbc {} 0 testdev 0", TEST_KEY)).err(),
        invalid(DmInvalidArgument::ChainingMode)
    );
    assert_eq!(
        env.ctr(&alloc::format!("blowfish-plain {} 0 testdev 0", TEST_KEY)).err(),
        invalid(DmInvalidArgument::CipherUnavailable)
    );
    assert_eq!(
        env.ctr("aes-plain 000102030405060708090a0b0c0d0e0g 0 testdev 0").err(),
        invalid(DmInvalidArgument::KeyDecoding)
    );
    assert_eq!(
        env.ctr("aes-plain 000102030405060708090a0b0c0d0e0 0 testdev 0").err(),
        invalid(DmInvalidArgument::KeyDecoding)
    );
    assert_eq!(
        env.ctr("aes-plain 000102030405060708090a0b0c0d0e 0 testdev 0").err(),
        invalid(DmInvalidArgument::KeySetup)
    );
    assert_eq!(
        env.ctr(&alloc::format!("aes-plain {} x testdev 0", TEST_KEY)).err(),
        invalid(DmInvalidArgument::IvOffset)
    );
    assert_eq!(
        env.ctr(&alloc::format!("aes-plain {} 0 testdev -1", TEST_KEY)).err(),
        invalid(DmInvalidArgument::DeviceSector)
    );
    assert_eq!(
        env.ctr(&alloc::format!("aes-plain {} 0 nodev 0", TEST_KEY)).err(),
        invalid(DmInvalidArgument::DeviceLookup)
    );

    let provider = TestCipherProvider::new(false);
    assert_eq!(
        CryptTarget::ctr(
            TEST_GEOMETRY,
            &["test-plain", TEST_KEY, "0", "testdev", "0"],
            &env.env(&provider)
        )
        .err(),
        invalid(DmInvalidArgument::NotBlockCipher)
    );

    // Extra cipher options only get warned about.
    assert!(env.ctr(&alloc::format!("aes-plain-essiv {} 0 testdev 0", TEST_KEY)).is_ok());
}
