//! Postlist merge behaviour: metadata, value statistics, value chunks,
//! and posting-chunk re-assembly.

#[cfg(test)]
mod tests {
    use crate::compact::tests::helpers::*;
    use crate::compact::CompactConfig;
    use crate::pack::{
        encode_valuestats, pack_postlist_key, pack_uint, pack_uint_preserving_sort,
    };
    use crate::source::TableKind;
    use tempfile::TempDir;

    /// # Scenario
    /// One source holding two user-metadata records, compacted with
    /// offset 0.
    ///
    /// # Expected behavior
    /// The output postlist table holds exactly the input records and the
    /// root record counts 2 entries.
    #[test]
    fn single_source_copy() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let mut db = MemDb::new();
        let postlist = db.table_mut(TableKind::Postlist);
        postlist.insert(metadata_key(b"A"), b"alpha".to_vec());
        postlist.insert(metadata_key(b"B"), b"beta".to_vec());

        let sink =
            compact_into_dir(&[&db], &[0], 2, dir.path(), &CompactConfig::default(), None)
                .unwrap();

        let records = read_table(dir.path(), TableKind::Postlist, &sink);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], (metadata_key(b"A"), b"alpha".to_vec(), false));
        assert_eq!(records[1], (metadata_key(b"B"), b"beta".to_vec(), false));
        assert_eq!(sink.roots[&TableKind::Postlist].num_entries, 2);
        assert_eq!(sink.last_docid, 2);
        assert!(sink.written && sink.synced);
    }

    /// # Scenario
    /// The same metadata key in two sources, no observer configured.
    ///
    /// # Expected behavior
    /// The first source's tag wins.
    #[test]
    fn metadata_conflict_first_wins_without_resolver() {
        let dir = TempDir::new().unwrap();
        let mut db1 = MemDb::new();
        db1.table_mut(TableKind::Postlist)
            .insert(metadata_key(b"foo"), b"X".to_vec());
        let mut db2 = MemDb::new();
        db2.table_mut(TableKind::Postlist)
            .insert(metadata_key(b"foo"), b"Y".to_vec());

        let sink = compact_into_dir(
            &[&db1, &db2],
            &[0, 100],
            100,
            dir.path(),
            &CompactConfig::default(),
            None,
        )
        .unwrap();

        let records = read_table(dir.path(), TableKind::Postlist, &sink);
        assert_eq!(records, vec![(metadata_key(b"foo"), b"X".to_vec(), false)]);
    }

    /// # Scenario
    /// The same metadata key in two sources, with an observer whose
    /// resolver returns a fixed tag.
    ///
    /// # Expected behavior
    /// The resolver is invoked exactly once, with both tags in source
    /// order, and its result is stored.
    #[test]
    fn metadata_conflict_uses_resolver() {
        let dir = TempDir::new().unwrap();
        let mut db1 = MemDb::new();
        db1.table_mut(TableKind::Postlist)
            .insert(metadata_key(b"foo"), b"X".to_vec());
        let mut db2 = MemDb::new();
        db2.table_mut(TableKind::Postlist)
            .insert(metadata_key(b"foo"), b"Y".to_vec());

        let mut observer = RecordingObserver {
            resolved_tag: Some(b"Z".to_vec()),
            ..RecordingObserver::default()
        };
        let sink = compact_into_dir(
            &[&db1, &db2],
            &[0, 100],
            100,
            dir.path(),
            &CompactConfig::default(),
            Some(&mut observer),
        )
        .unwrap();

        assert_eq!(observer.resolve_calls.len(), 1);
        assert_eq!(observer.resolve_calls[0].0, metadata_key(b"foo"));
        assert_eq!(
            observer.resolve_calls[0].1,
            vec![b"X".to_vec(), b"Y".to_vec()]
        );

        let records = read_table(dir.path(), TableKind::Postlist, &sink);
        assert_eq!(records, vec![(metadata_key(b"foo"), b"Z".to_vec(), false)]);
    }

    /// # Scenario
    /// Value statistics for slot 7 in two sources: `(3, "ant", "cat")`
    /// and `(4, "bat", "dog")`.
    ///
    /// # Expected behavior
    /// Frequencies sum and the bounds widen: `(7, "ant", "dog")`.
    #[test]
    fn valuestats_fold() {
        let dir = TempDir::new().unwrap();
        let mut db1 = MemDb::new();
        db1.table_mut(TableKind::Postlist)
            .insert(valuestats_key(7), encode_valuestats(3, b"ant", b"cat"));
        let mut db2 = MemDb::new();
        db2.table_mut(TableKind::Postlist)
            .insert(valuestats_key(7), encode_valuestats(4, b"bat", b"dog"));

        let sink = compact_into_dir(
            &[&db1, &db2],
            &[0, 100],
            100,
            dir.path(),
            &CompactConfig::default(),
            None,
        )
        .unwrap();

        let records = read_table(dir.path(), TableKind::Postlist, &sink);
        assert_eq!(
            records,
            vec![(
                valuestats_key(7),
                encode_valuestats(7, b"ant", b"dog"),
                false
            )]
        );
    }

    /// # Scenario
    /// Value-stream chunks for the same slot in two sources, the second
    /// with offset 100.
    ///
    /// # Expected behavior
    /// Chunks copy through with the second source's key rebuilt around
    /// the shifted docid; tags are untouched.
    #[test]
    fn valuechunks_shift_and_copy() {
        let dir = TempDir::new().unwrap();
        let mut db1 = MemDb::new();
        db1.table_mut(TableKind::Postlist)
            .insert(valuechunk_key(1, 1), b"chunk-one".to_vec());
        let mut db2 = MemDb::new();
        db2.table_mut(TableKind::Postlist)
            .insert(valuechunk_key(1, 1), b"chunk-two".to_vec());

        let sink = compact_into_dir(
            &[&db1, &db2],
            &[0, 100],
            101,
            dir.path(),
            &CompactConfig::default(),
            None,
        )
        .unwrap();

        let records = read_table(dir.path(), TableKind::Postlist, &sink);
        assert_eq!(
            records,
            vec![
                (valuechunk_key(1, 1), b"chunk-one".to_vec(), false),
                (valuechunk_key(1, 101), b"chunk-two".to_vec(), false),
            ]
        );
    }

    /// # Scenario
    /// One term with a two-chunk posting list in a single source,
    /// compacted with offset 0.
    ///
    /// # Expected behavior
    /// The output reproduces the input: header totals unchanged,
    /// continuation flags preserved ('0' then '1').
    #[test]
    fn single_source_chunked_term_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut db = MemDb::new();
        let postlist = db.table_mut(TableKind::Postlist);
        postlist.insert(
            initial_postlist_key(b"hello"),
            initial_postlist_tag(3, 5, 2, b"0abc"),
        );
        postlist.insert(pack_postlist_key(b"hello", 9), b"1def".to_vec());

        let sink =
            compact_into_dir(&[&db], &[0], 20, dir.path(), &CompactConfig::default(), None)
                .unwrap();

        let records = read_table(dir.path(), TableKind::Postlist, &sink);
        assert_eq!(
            records,
            vec![
                (
                    initial_postlist_key(b"hello"),
                    initial_postlist_tag(3, 5, 2, b"0abc"),
                    false
                ),
                (pack_postlist_key(b"hello", 9), b"1def".to_vec(), false),
            ]
        );
    }

    /// # Scenario
    /// The same term in two sources (single-chunk each), second source
    /// offset by 100.
    ///
    /// # Expected behavior
    /// One merged posting list: the initial chunk carries summed `tf`/`cf`
    /// and the first chunk's body reflagged '0'; the second source's chunk
    /// becomes a continuation keyed by its shifted first docid, flagged
    /// '1'.
    #[test]
    fn two_sources_merge_one_term() {
        let dir = TempDir::new().unwrap();
        let mut db1 = MemDb::new();
        db1.table_mut(TableKind::Postlist).insert(
            initial_postlist_key(b"term"),
            initial_postlist_tag(3, 7, 2, b"1aa"),
        );
        let mut db2 = MemDb::new();
        db2.table_mut(TableKind::Postlist).insert(
            initial_postlist_key(b"term"),
            initial_postlist_tag(4, 11, 1, b"1bb"),
        );

        let sink = compact_into_dir(
            &[&db1, &db2],
            &[0, 100],
            101,
            dir.path(),
            &CompactConfig::default(),
            None,
        )
        .unwrap();

        let records = read_table(dir.path(), TableKind::Postlist, &sink);
        assert_eq!(
            records,
            vec![
                (
                    initial_postlist_key(b"term"),
                    initial_postlist_tag(7, 18, 2, b"0aa"),
                    false
                ),
                (pack_postlist_key(b"term", 101), b"1bb".to_vec(), false),
            ]
        );
    }

    /// # Scenario
    /// Two sources with disjoint terms, the second offset by 100.
    ///
    /// # Expected behavior
    /// Both terms appear, each as a self-contained single-chunk list; the
    /// second term's first docid is shifted by 100 in its header.
    #[test]
    fn two_sources_disjoint_terms() {
        let dir = TempDir::new().unwrap();
        let mut db1 = MemDb::new();
        db1.table_mut(TableKind::Postlist).insert(
            initial_postlist_key(b"apple"),
            initial_postlist_tag(1, 1, 3, b"1xx"),
        );
        let mut db2 = MemDb::new();
        db2.table_mut(TableKind::Postlist).insert(
            initial_postlist_key(b"cherry"),
            initial_postlist_tag(1, 2, 4, b"1yy"),
        );

        let sink = compact_into_dir(
            &[&db1, &db2],
            &[0, 100],
            104,
            dir.path(),
            &CompactConfig::default(),
            None,
        )
        .unwrap();

        let records = read_table(dir.path(), TableKind::Postlist, &sink);
        assert_eq!(
            records,
            vec![
                (
                    initial_postlist_key(b"apple"),
                    initial_postlist_tag(1, 1, 3, b"1xx"),
                    false
                ),
                (
                    initial_postlist_key(b"cherry"),
                    initial_postlist_tag(1, 2, 104, b"1yy"),
                    false
                ),
            ]
        );
    }

    /// # Scenario
    /// Document-length chunks in two sources, second offset by 100.
    ///
    /// # Expected behavior
    /// Doclen lists merge like a term with an empty name: one initial
    /// chunk under the fixed prefix, then a continuation keyed by the
    /// shifted docid.
    #[test]
    fn doclen_chunks_merge() {
        let dir = TempDir::new().unwrap();
        let mut db1 = MemDb::new();
        db1.table_mut(TableKind::Postlist).insert(
            doclen_initial_key(),
            initial_postlist_tag(5, 9, 1, b"1dl-one"),
        );
        let mut db2 = MemDb::new();
        db2.table_mut(TableKind::Postlist).insert(
            doclen_initial_key(),
            initial_postlist_tag(6, 10, 1, b"1dl-two"),
        );

        let sink = compact_into_dir(
            &[&db1, &db2],
            &[0, 100],
            101,
            dir.path(),
            &CompactConfig::default(),
            None,
        )
        .unwrap();

        let mut continuation_key = doclen_initial_key();
        pack_uint_preserving_sort(&mut continuation_key, 101);

        let records = read_table(dir.path(), TableKind::Postlist, &sink);
        assert_eq!(
            records,
            vec![
                (
                    doclen_initial_key(),
                    initial_postlist_tag(11, 19, 1, b"0dl-one"),
                    false
                ),
                (continuation_key, b"1dl-two".to_vec(), false),
            ]
        );
    }

    /// # Scenario
    /// A full postlist table (metadata, valuestats, valuechunks, doclen,
    /// terms) compacted once, then the output compacted again with
    /// offset 0.
    ///
    /// # Expected behavior
    /// The second compaction reproduces the first output record for
    /// record.
    #[test]
    fn recompaction_is_idempotent() {
        let dir1 = TempDir::new().unwrap();
        let dir2 = TempDir::new().unwrap();
        let mut db = MemDb::new();
        {
            let postlist = db.table_mut(TableKind::Postlist);
            postlist.insert(metadata_key(b"meta"), b"m".to_vec());
            postlist.insert(valuestats_key(1), encode_valuestats(2, b"a", b"z"));
            postlist.insert(valuechunk_key(1, 1), b"vchunk".to_vec());
            postlist.insert(doclen_initial_key(), initial_postlist_tag(4, 4, 1, b"1dl"));
            postlist.insert(
                initial_postlist_key(b"one"),
                initial_postlist_tag(2, 3, 1, b"0c1"),
            );
            postlist.insert(pack_postlist_key(b"one", 5), b"1c2".to_vec());
            postlist.insert(
                initial_postlist_key(b"two"),
                initial_postlist_tag(1, 1, 4, b"1c3"),
            );
        }
        {
            let termlist = db.table_mut(TableKind::TermList);
            termlist.insert(docid_key(1), b"terms-1".to_vec());
        }

        let config = CompactConfig::default();
        let sink1 = compact_into_dir(&[&db], &[0], 5, dir1.path(), &config, None).unwrap();
        let first = read_table(dir1.path(), TableKind::Postlist, &sink1);

        let redb = db_from_output(dir1.path(), &sink1);
        let sink2 = compact_into_dir(&[&redb], &[0], 5, dir2.path(), &config, None).unwrap();
        let second = read_table(dir2.path(), TableKind::Postlist, &sink2);

        assert_eq!(first, second);
        assert_eq!(
            read_table(dir1.path(), TableKind::TermList, &sink1),
            read_table(dir2.path(), TableKind::TermList, &sink2)
        );
    }

    /// # Scenario
    /// A corrupt initial chunk whose tag is too short for its header.
    #[test]
    fn truncated_chunk_header_is_corruption() {
        let dir = TempDir::new().unwrap();
        let mut db = MemDb::new();
        let mut short_tag = Vec::new();
        pack_uint(&mut short_tag, 3);
        db.table_mut(TableKind::Postlist)
            .insert(initial_postlist_key(b"bad"), short_tag);

        let err = compact_into_dir(&[&db], &[0], 1, dir.path(), &CompactConfig::default(), None)
            .unwrap_err();
        assert!(matches!(err, crate::compact::CompactError::Corrupt(_)));
    }
}
