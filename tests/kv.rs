//! # Key-Value Engine Tests
//!
//! End-to-end coverage of the transactional surface: round-trips across
//! reopen, cursor ordering, rollback semantics, overflow values, and the
//! bucket registry operations.

use cowdb::{Db, Error, Options};
use tempfile::tempdir;

fn test_options() -> Options {
    Options {
        page_size: 4096,
        mmap_size: 1 << 24,
    }
}

mod roundtrip_tests {
    use super::*;

    #[test]
    fn put_commit_reopen_get() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.db");

        {
            let db = Db::open_with(&path, test_options()).unwrap();
            let tx = db.begin(true).unwrap();
            let bucket = tx.create_bucket("b").unwrap();
            bucket.put(b"k", b"v").unwrap();
            tx.commit().unwrap();
        }

        let db = Db::open_with(&path, test_options()).unwrap();
        let tx = db.begin(false).unwrap();
        let bucket = tx.get_bucket("b").unwrap();
        assert_eq!(bucket.get(b"k").unwrap().as_deref(), Some(b"v" as &[u8]));
    }

    #[test]
    fn get_missing_key_is_none() {
        let dir = tempdir().unwrap();
        let db = Db::open_with(dir.path().join("app.db"), test_options()).unwrap();

        db.update(|tx| {
            tx.create_bucket("b")?.put(b"k", b"v")?;
            Ok(())
        })
        .unwrap();

        db.view(|tx| {
            assert_eq!(tx.get_bucket("b")?.get(b"other")?, None);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn put_twice_is_idempotent() {
        let dir = tempdir().unwrap();
        let db = Db::open_with(dir.path().join("app.db"), test_options()).unwrap();

        db.update(|tx| {
            let bucket = tx.create_bucket("b")?;
            bucket.put(b"k", b"v")?;
            bucket.put(b"k", b"v")?;
            Ok(())
        })
        .unwrap();

        db.view(|tx| {
            let bucket = tx.get_bucket("b")?;
            assert_eq!(bucket.get(b"k")?.as_deref(), Some(b"v" as &[u8]));
            let mut cursor = bucket.cursor();
            let mut count = 0;
            while cursor.next()?.is_some() {
                count += 1;
            }
            assert_eq!(count, 1, "replacement must not duplicate the key");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn overwrite_across_commits() {
        let dir = tempdir().unwrap();
        let db = Db::open_with(dir.path().join("app.db"), test_options()).unwrap();

        db.update(|tx| {
            tx.create_bucket("b")?.put(b"k", b"v1")?;
            Ok(())
        })
        .unwrap();
        db.update(|tx| {
            tx.get_bucket("b")?.put(b"k", b"v2")?;
            Ok(())
        })
        .unwrap();

        db.view(|tx| {
            assert_eq!(tx.get_bucket("b")?.get(b"k")?.as_deref(), Some(b"v2" as &[u8]));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn delete_key_roundtrip() {
        let dir = tempdir().unwrap();
        let db = Db::open_with(dir.path().join("app.db"), test_options()).unwrap();

        db.update(|tx| {
            let bucket = tx.create_bucket("b")?;
            bucket.put(b"keep", b"1")?;
            bucket.put(b"drop", b"2")?;
            Ok(())
        })
        .unwrap();
        db.update(|tx| {
            let bucket = tx.get_bucket("b")?;
            bucket.delete(b"drop")?;
            bucket.delete(b"never-existed")?;
            Ok(())
        })
        .unwrap();

        db.view(|tx| {
            let bucket = tx.get_bucket("b")?;
            assert_eq!(bucket.get(b"drop")?, None);
            assert_eq!(bucket.get(b"keep")?.as_deref(), Some(b"1" as &[u8]));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn bulk_load_10k_one_kib_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bulk.db");
        let db = Db::open_with(&path, test_options()).unwrap();

        db.update(|tx| {
            let bucket = tx.create_bucket("bulk")?;
            for i in 0..10_000u32 {
                let key = format!("key{i:08}");
                let value = vec![(i % 251) as u8; 1024];
                bucket.put(key.as_bytes(), &value)?;
            }
            Ok(())
        })
        .unwrap();

        let file_size = std::fs::metadata(&path).unwrap().len();
        assert!(file_size > 10_000 * 1024, "all values are on disk");
        assert!(
            file_size < 4 * 10_000 * 1024,
            "overhead stays bounded, got {file_size}"
        );

        db.view(|tx| {
            let bucket = tx.get_bucket("bulk")?;
            for i in (0..10_000u32).step_by(271) {
                let key = format!("key{i:08}");
                let expected = vec![(i % 251) as u8; 1024];
                assert_eq!(
                    bucket.get(key.as_bytes())?.as_deref(),
                    Some(expected.as_slice()),
                    "missing {key}"
                );
            }
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn value_larger_than_a_page_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.db");
        let big = (0..50_000u32).flat_map(|i| i.to_le_bytes()).collect::<Vec<u8>>();

        {
            let db = Db::open_with(&path, test_options()).unwrap();
            db.update(|tx| {
                tx.create_bucket("b")?.put(b"big", &big)?;
                Ok(())
            })
            .unwrap();
        }

        let db = Db::open_with(&path, test_options()).unwrap();
        db.view(|tx| {
            assert_eq!(tx.get_bucket("b")?.get(b"big")?.as_deref(), Some(big.as_slice()));
            Ok(())
        })
        .unwrap();
    }
}

mod boundary_tests {
    use super::*;

    #[test]
    fn empty_key_is_rejected() {
        let dir = tempdir().unwrap();
        let db = Db::open_with(dir.path().join("app.db"), test_options()).unwrap();

        let tx = db.begin(true).unwrap();
        let bucket = tx.create_bucket("b").unwrap();

        assert!(matches!(
            bucket.put(b"", b"v"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(bucket.get(b""), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn oversized_key_is_rejected() {
        let dir = tempdir().unwrap();
        let db = Db::open_with(dir.path().join("app.db"), test_options()).unwrap();

        let tx = db.begin(true).unwrap();
        let bucket = tx.create_bucket("b").unwrap();
        let key = vec![b'k'; 4096];

        assert!(matches!(
            bucket.put(&key, b"v"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn empty_value_is_fine() {
        let dir = tempdir().unwrap();
        let db = Db::open_with(dir.path().join("app.db"), test_options()).unwrap();

        db.update(|tx| {
            tx.create_bucket("b")?.put(b"k", b"")?;
            Ok(())
        })
        .unwrap();

        db.view(|tx| {
            assert_eq!(tx.get_bucket("b")?.get(b"k")?.as_deref(), Some(b"" as &[u8]));
            Ok(())
        })
        .unwrap();
    }
}

mod cursor_tests {
    use super::*;

    #[test]
    fn cursor_yields_keys_in_ascending_order() {
        let dir = tempdir().unwrap();
        let db = Db::open_with(dir.path().join("app.db"), test_options()).unwrap();

        db.update(|tx| {
            let bucket = tx.create_bucket("letters")?;
            // insert out of order on purpose
            for c in ('a'..='z').rev() {
                bucket.put(c.to_string().as_bytes(), b"")?;
            }
            Ok(())
        })
        .unwrap();

        db.view(|tx| {
            let bucket = tx.get_bucket("letters")?;
            let mut cursor = bucket.cursor();
            let mut seen = Vec::new();
            while let Some((key, value)) = cursor.next()? {
                assert!(value.is_empty());
                seen.push(String::from_utf8(key).unwrap());
            }
            let expected: Vec<String> = ('a'..='z').map(|c| c.to_string()).collect();
            assert_eq!(seen, expected);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn cursor_spans_multiple_leaves() {
        let dir = tempdir().unwrap();
        let db = Db::open_with(dir.path().join("app.db"), test_options()).unwrap();
        let count = 2_000u32;

        db.update(|tx| {
            let bucket = tx.create_bucket("b")?;
            for i in 0..count {
                bucket.put(format!("key{i:06}").as_bytes(), &i.to_le_bytes())?;
            }
            Ok(())
        })
        .unwrap();

        db.view(|tx| {
            let mut cursor = tx.get_bucket("b")?.cursor();
            let mut previous: Option<Vec<u8>> = None;
            let mut seen = 0u32;
            while let Some((key, value)) = cursor.next()? {
                if let Some(prev) = &previous {
                    assert!(prev.as_slice() < key.as_slice(), "strictly ascending");
                }
                assert_eq!(value, seen.to_le_bytes());
                previous = Some(key);
                seen += 1;
            }
            assert_eq!(seen, count);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn cursor_sees_uncommitted_writes_of_its_own_tx() {
        let dir = tempdir().unwrap();
        let db = Db::open_with(dir.path().join("app.db"), test_options()).unwrap();

        db.update(|tx| {
            let bucket = tx.create_bucket("b")?;
            bucket.put(b"committed", b"1")?;
            Ok(())
        })
        .unwrap();

        let tx = db.begin(true).unwrap();
        let bucket = tx.get_bucket("b").unwrap();
        bucket.put(b"pending", b"2").unwrap();

        let mut cursor = bucket.cursor();
        let mut keys = Vec::new();
        while let Some((key, _)) = cursor.next().unwrap() {
            keys.push(key);
        }
        assert_eq!(keys, vec![b"committed".to_vec(), b"pending".to_vec()]);
    }

    #[test]
    fn cursor_on_empty_bucket_is_empty() {
        let dir = tempdir().unwrap();
        let db = Db::open_with(dir.path().join("app.db"), test_options()).unwrap();

        db.update(|tx| {
            tx.create_bucket("empty")?;
            Ok(())
        })
        .unwrap();

        db.view(|tx| {
            let mut cursor = tx.get_bucket("empty")?.cursor();
            assert!(cursor.next()?.is_none());
            Ok(())
        })
        .unwrap();
    }
}

mod rollback_tests {
    use super::*;

    #[test]
    fn rollback_discards_writes() {
        let dir = tempdir().unwrap();
        let db = Db::open_with(dir.path().join("app.db"), test_options()).unwrap();

        db.update(|tx| {
            tx.create_bucket("b")?.put(b"k", b"v1")?;
            Ok(())
        })
        .unwrap();

        {
            let tx = db.begin(true).unwrap();
            tx.get_bucket("b").unwrap().put(b"k", b"v2").unwrap();
            tx.rollback().unwrap();
        }

        db.view(|tx| {
            assert_eq!(tx.get_bucket("b")?.get(b"k")?.as_deref(), Some(b"v1" as &[u8]));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn dropping_a_write_tx_rolls_back() {
        let dir = tempdir().unwrap();
        let db = Db::open_with(dir.path().join("app.db"), test_options()).unwrap();

        db.update(|tx| {
            tx.create_bucket("b")?.put(b"k", b"v1")?;
            Ok(())
        })
        .unwrap();

        {
            let tx = db.begin(true).unwrap();
            tx.get_bucket("b").unwrap().put(b"k", b"v2").unwrap();
            // dropped without commit
        }

        db.view(|tx| {
            assert_eq!(tx.get_bucket("b")?.get(b"k")?.as_deref(), Some(b"v1" as &[u8]));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn update_rolls_back_on_error() {
        let dir = tempdir().unwrap();
        let db = Db::open_with(dir.path().join("app.db"), test_options()).unwrap();

        db.update(|tx| {
            tx.create_bucket("b")?.put(b"k", b"v1")?;
            Ok(())
        })
        .unwrap();

        let result: cowdb::Result<()> = db.update(|tx| {
            tx.get_bucket("b")?.put(b"k", b"v2")?;
            Err(Error::InvalidArgument("caller changed its mind"))
        });
        assert!(result.is_err());

        db.view(|tx| {
            assert_eq!(tx.get_bucket("b")?.get(b"k")?.as_deref(), Some(b"v1" as &[u8]));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn commit_ends_the_transaction() {
        let dir = tempdir().unwrap();
        let db = Db::open_with(dir.path().join("app.db"), test_options()).unwrap();

        let tx = db.begin(true).unwrap();
        tx.create_bucket("b").unwrap();
        tx.commit().unwrap();

        // the writer slot is free again and the commit is visible
        let tx = db.begin(true).unwrap();
        assert!(tx.get_bucket("b").is_ok());
        tx.rollback().unwrap();
    }

    #[test]
    fn mutations_on_read_tx_fail() {
        let dir = tempdir().unwrap();
        let db = Db::open_with(dir.path().join("app.db"), test_options()).unwrap();

        db.update(|tx| {
            tx.create_bucket("b")?;
            Ok(())
        })
        .unwrap();

        let tx = db.begin(false).unwrap();
        let bucket = tx.get_bucket("b").unwrap();
        assert!(matches!(bucket.put(b"k", b"v"), Err(Error::TxReadOnly)));
        assert!(matches!(bucket.delete(b"k"), Err(Error::TxReadOnly)));
        assert!(matches!(tx.create_bucket("c"), Err(Error::TxReadOnly)));
        assert!(matches!(tx.delete_bucket("b"), Err(Error::TxReadOnly)));
    }
}

mod bucket_registry_tests {
    use super::*;

    #[test]
    fn create_bucket_twice_fails() {
        let dir = tempdir().unwrap();
        let db = Db::open_with(dir.path().join("app.db"), test_options()).unwrap();

        let tx = db.begin(true).unwrap();
        tx.create_bucket("b").unwrap();
        assert!(matches!(tx.create_bucket("b"), Err(Error::BucketExists(_))));
    }

    #[test]
    fn create_bucket_empty_name_fails() {
        let dir = tempdir().unwrap();
        let db = Db::open_with(dir.path().join("app.db"), test_options()).unwrap();

        let tx = db.begin(true).unwrap();
        assert!(matches!(
            tx.create_bucket(""),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn get_missing_bucket_fails() {
        let dir = tempdir().unwrap();
        let db = Db::open_with(dir.path().join("app.db"), test_options()).unwrap();

        db.view(|tx| {
            assert!(matches!(
                tx.get_bucket("ghost"),
                Err(Error::BucketNotFound(_))
            ));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn delete_bucket_removes_it_durably() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.db");

        {
            let db = Db::open_with(&path, test_options()).unwrap();
            db.update(|tx| {
                tx.create_bucket("doomed")?.put(b"k", b"v")?;
                tx.create_bucket("kept")?.put(b"k", b"v")?;
                Ok(())
            })
            .unwrap();
            db.update(|tx| tx.delete_bucket("doomed")).unwrap();
        }

        let db = Db::open_with(&path, test_options()).unwrap();
        db.view(|tx| {
            assert!(matches!(
                tx.get_bucket("doomed"),
                Err(Error::BucketNotFound(_))
            ));
            assert_eq!(tx.get_bucket("kept")?.get(b"k")?.as_deref(), Some(b"v" as &[u8]));
            assert_eq!(tx.bucket_names(), vec!["kept".to_string()]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn many_buckets_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.db");

        {
            let db = Db::open_with(&path, test_options()).unwrap();
            db.update(|tx| {
                for i in 0..40 {
                    let name = format!("bucket-{i:02}");
                    tx.create_bucket(&name)?.put(b"id", name.as_bytes())?;
                }
                Ok(())
            })
            .unwrap();
        }

        let db = Db::open_with(&path, test_options()).unwrap();
        db.view(|tx| {
            assert_eq!(tx.bucket_names().len(), 40);
            for i in 0..40 {
                let name = format!("bucket-{i:02}");
                assert_eq!(
                    tx.get_bucket(&name)?.get(b"id")?.as_deref(),
                    Some(name.as_bytes())
                );
            }
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn next_id_is_monotonic_and_durable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.db");

        {
            let db = Db::open_with(&path, test_options()).unwrap();
            db.update(|tx| {
                let bucket = tx.create_bucket("seq")?;
                assert_eq!(bucket.next_id()?, 1);
                assert_eq!(bucket.next_id()?, 2);
                Ok(())
            })
            .unwrap();
        }

        let db = Db::open_with(&path, test_options()).unwrap();
        db.update(|tx| {
            assert_eq!(tx.get_bucket("seq")?.next_id()?, 3);
            Ok(())
        })
        .unwrap();
    }
}
