mod helpers;

use std::sync::Arc;
use std::thread;

use careledger_core::{
  anchors::{ConsentAction, ConsentAnchor, IntoAnchor},
  chain::{AnchorContext, Chain},
  constants::GENESIS_HASH,
  hash_data, sha256_hex,
  query::TransactionFilter,
  LedgerConfig, LedgerError, RecordType,
};
use careledger_storage::{ChainStore, MemoryStore, SledStore};
use helpers::{create_temp_store, memory_chain, memory_chain_with, teardown_store};
use serde_json::json;

fn anchor_n<S: ChainStore + ?Sized>(chain: &Chain<S>, n: usize) -> anyhow::Result<()> {
  for i in 0..n {
    chain.anchor_record(
      RecordType::AuditLog,
      &format!("LOG-{i}"),
      &json!({ "event": "login", "seq": i }),
      AnchorContext::default(),
    )?;
  }
  Ok(())
}

#[test]
fn test_prescription_anchor_scenario() -> anyhow::Result<()> {
  let chain = memory_chain();
  let block = chain.anchor_record(
    RecordType::Prescription,
    "RX-1",
    &json!({ "drug": "Amoxicillin" }),
    AnchorContext::actor("dr-1"),
  )?;

  let genesis = chain.get_block_by_number(0)?;
  assert_eq!(genesis.previous_hash, GENESIS_HASH);
  assert_eq!(block.block_number, 1);
  assert_eq!(block.previous_hash, genesis.hash);
  assert_eq!(block.data_hash, sha256_hex(br#"{"drug":"Amoxicillin"}"#));
  assert!(block.hash.starts_with("00"));
  assert_eq!(block.metadata.get("anchored_by").map(String::as_str), Some("dr-1"));

  let verification = chain.verify_record(&block.data_hash)?;
  assert!(verification.verified);
  assert_eq!(verification.block.as_ref(), Some(&block));
  Ok(())
}

#[test]
fn test_verify_unknown_hash_is_not_found() -> anyhow::Result<()> {
  let chain = memory_chain();
  anchor_n(&chain, 2)?;
  let verification = chain.verify_record(&sha256_hex(b"never anchored"))?;
  assert!(!verification.verified);
  assert!(verification.block.is_none());
  assert_eq!(verification.reason, "not found");
  Ok(())
}

#[test]
fn test_genesis_is_created_once() -> anyhow::Result<()> {
  let chain = memory_chain();
  let first = chain.ensure_genesis()?;
  let second = chain.ensure_genesis()?;
  assert_eq!(first, second);

  let ctx = AnchorContext::default;
  chain.anchor_record(RecordType::Appointment, "APT-1", &json!({"slot": 1}), ctx())?;
  chain.anchor_record(RecordType::Appointment, "APT-2", &json!({"slot": 2}), ctx())?;

  let genesis_blocks = chain
    .list_transactions(&TransactionFilter::default(), None, None)?
    .transactions
    .into_iter()
    .filter(|b| b.block_number == 0)
    .count();
  assert_eq!(genesis_blocks, 1);
  assert_eq!(chain.store().block_count()?, 3);
  Ok(())
}

#[test]
fn test_anchor_on_empty_store_creates_genesis_then_block_one() -> anyhow::Result<()> {
  let chain = memory_chain();
  let block =
    chain.anchor_record(RecordType::AuditLog, "LOG-0", "raw text", AnchorContext::default())?;
  assert_eq!(block.block_number, 1);
  assert_eq!(block.data_hash, sha256_hex(b"raw text"));
  assert_eq!(chain.get_block_by_number(0)?.record_id, "genesis");
  Ok(())
}

#[test]
fn test_chain_linkage_and_self_consistency() -> anyhow::Result<()> {
  let chain = memory_chain();
  anchor_n(&chain, 10)?;
  let blocks: Vec<_> = chain.store().blocks_from(0).collect::<Result<_, _>>()?;
  assert_eq!(blocks.len(), 11);
  for (i, block) in blocks.iter().enumerate() {
    assert_eq!(block.block_number, i as u64);
    assert!(block.is_self_consistent());
    if i > 0 {
      assert_eq!(block.previous_hash, blocks[i - 1].hash);
    }
  }
  let report = chain.verify_chain_integrity()?;
  assert!(report.valid, "{}", report.message);
  assert_eq!(report.total_blocks, 11);
  assert_eq!(report.last_block, Some(10));
  Ok(())
}

#[test]
fn test_empty_chain_is_trivially_valid() -> anyhow::Result<()> {
  let chain = memory_chain();
  let report = chain.verify_chain_integrity()?;
  assert!(report.valid);
  assert_eq!(report.total_blocks, 0);
  assert_eq!(report.message, "Empty chain");
  Ok(())
}

#[test]
fn test_nonce_tamper_flags_only_that_block() -> anyhow::Result<()> {
  let store = Arc::new(MemoryStore::new());
  let chain = Chain::new(store.clone());
  anchor_n(&chain, 5)?;

  assert!(store.tamper_with(3, |b| b.nonce += 1));
  let report = chain.verify_chain_integrity()?;
  assert!(!report.valid);
  assert_eq!(report.invalid_blocks, vec![3]);
  assert!(report.broken_links.is_empty());
  assert!(report.missing_blocks.is_empty());
  Ok(())
}

#[test]
fn test_data_hash_tamper_is_reported_by_verify_record() -> anyhow::Result<()> {
  let store = Arc::new(MemoryStore::new());
  let chain = Chain::new(store.clone());
  anchor_n(&chain, 4)?;

  let forged = hash_data(&json!({ "event": "forged" }))?;
  store.tamper_with(2, |b| b.data_hash = forged.clone());

  let report = chain.verify_chain_integrity()?;
  assert_eq!(report.invalid_blocks, vec![2]);

  let verification = chain.verify_record(&forged)?;
  assert!(!verification.verified);
  assert!(verification.reason.contains("tampering"));
  Ok(())
}

#[test]
fn test_relinked_block_reports_hash_and_link() -> anyhow::Result<()> {
  let store = Arc::new(MemoryStore::new());
  let chain = Chain::new(store.clone());
  anchor_n(&chain, 4)?;

  store.tamper_with(2, |b| b.previous_hash = "f".repeat(64));
  let report = chain.verify_chain_integrity()?;
  assert_eq!(report.invalid_blocks, vec![2]);
  assert_eq!(report.broken_links.len(), 1);
  assert_eq!(report.broken_links[0].block_number, 2);
  assert_eq!(report.broken_links[0].got, "f".repeat(64));
  assert_eq!(report.broken_links[0].expected, chain.get_block_by_number(1)?.hash);
  Ok(())
}

#[test]
fn test_deleted_block_reports_gap_and_broken_link() -> anyhow::Result<()> {
  let store = Arc::new(MemoryStore::new());
  let chain = Chain::new(store.clone());
  anchor_n(&chain, 4)?;

  let removed = store.remove_unchecked(2).expect("block 2 exists");
  let report = chain.verify_chain_integrity()?;
  assert!(!report.valid);
  assert_eq!(report.missing_blocks, vec![2]);
  assert!(report.invalid_blocks.is_empty());
  assert_eq!(report.broken_links.len(), 1);
  assert_eq!(report.broken_links[0].block_number, 3);
  assert_eq!(report.broken_links[0].got, removed.hash);
  Ok(())
}

#[test]
fn test_anchor_refuses_tampered_tip() -> anyhow::Result<()> {
  let store = Arc::new(MemoryStore::new());
  let chain = Chain::new(store.clone());
  anchor_n(&chain, 2)?;
  store.tamper_with(2, |b| b.record_id = "LOG-forged".to_string());

  let err = chain
    .anchor_record(RecordType::AuditLog, "LOG-3", &json!({}), AnchorContext::default())
    .unwrap_err();
  assert!(matches!(err, LedgerError::TamperDetected { block_number: 2, .. }));
  assert_eq!(store.block_count()?, 3);
  Ok(())
}

#[test]
fn test_mining_exhaustion_writes_nothing() -> anyhow::Result<()> {
  let store = Arc::new(MemoryStore::new());
  Chain::new(store.clone()).ensure_genesis()?;

  let impossible = LedgerConfig::default().with_difficulty(64).with_max_iterations(25);
  let chain = Chain::with_config(store.clone(), impossible);
  let err = chain
    .anchor_record(
      RecordType::Prescription,
      "RX-9",
      &json!({"drug": "x"}),
      AnchorContext::default(),
    )
    .unwrap_err();
  assert!(matches!(err, LedgerError::MiningExhausted { block_number: 1, attempts: 25 }));
  assert!(err.is_retryable());
  assert_eq!(store.block_count()?, 1);
  Ok(())
}

#[test]
fn test_empty_record_id_is_rejected() {
  let chain = memory_chain();
  let err = chain
    .anchor_record(RecordType::AuditLog, "  ", &json!({}), AnchorContext::default())
    .unwrap_err();
  assert!(matches!(err, LedgerError::InvalidInput(_)));
}

#[test]
fn test_chain_stats_scenario() -> anyhow::Result<()> {
  let chain = memory_chain();
  for i in 0..3 {
    chain.anchor_record(
      RecordType::Prescription,
      &format!("RX-{i}"),
      &json!({ "n": i }),
      AnchorContext::default(),
    )?;
  }
  for i in 0..2 {
    chain.anchor_record(
      RecordType::ConsentGrant,
      &format!("C-{i}"),
      &json!({ "n": i }),
      AnchorContext::default(),
    )?;
  }

  let stats = chain.get_chain_stats()?;
  assert_eq!(stats.total_blocks, 6);
  assert_eq!(stats.type_counts.get("PRESCRIPTION"), Some(&3));
  assert_eq!(stats.type_counts.get("CONSENT_GRANT"), Some(&2));
  assert_eq!(stats.type_counts.get("AUDIT_LOG"), Some(&1));
  assert_eq!(stats.latest_block_number, Some(5));
  assert_eq!(stats.blocks_last_24h, 6);
  assert!(stats.chain_valid);
  assert_eq!(stats.difficulty, 2);
  // Stats is read-only: only an explicit verification records a checkpoint
  assert_eq!(stats.checkpoint, None);
  chain.verify_chain_integrity()?;
  assert_eq!(chain.get_chain_stats()?.checkpoint, Some(5));
  Ok(())
}

#[test]
fn test_stats_see_tampering_behind_the_checkpoint() -> anyhow::Result<()> {
  let store = Arc::new(MemoryStore::new());
  let chain = Chain::new(store.clone());
  anchor_n(&chain, 5)?;
  assert!(chain.verify_chain_integrity()?.valid);
  assert!(chain.get_chain_stats()?.chain_valid);
  assert_eq!(store.checkpoint()?.map(|cp| cp.block_number), Some(5));

  store.tamper_with(2, |b| b.data_hash = sha256_hex(b"forged"));
  // The incremental scan starts after block 5 and cannot see the edit
  assert!(chain.verify_since_checkpoint()?.valid);

  let stats = chain.get_chain_stats()?;
  assert!(!stats.chain_valid);
  assert_eq!(stats.checkpoint, Some(5));
  let full = chain.verify_chain_integrity()?;
  assert_eq!(full.invalid_blocks, vec![2]);
  Ok(())
}

#[test]
fn test_stats_do_not_move_the_checkpoint() -> anyhow::Result<()> {
  let store = Arc::new(MemoryStore::new());
  let chain = Chain::new(store.clone());
  anchor_n(&chain, 2)?;
  chain.verify_chain_integrity()?;
  anchor_n(&chain, 2)?;

  chain.get_chain_stats()?;
  assert_eq!(store.checkpoint()?.map(|cp| cp.block_number), Some(2));
  Ok(())
}

#[test]
fn test_checkpointed_scan_only_checks_new_blocks() -> anyhow::Result<()> {
  let store = Arc::new(MemoryStore::new());
  let chain = Chain::new(store.clone());
  anchor_n(&chain, 4)?;
  let full = chain.verify_chain_integrity()?;
  assert_eq!(full.checked_blocks, 5);
  assert_eq!(store.checkpoint()?.map(|cp| cp.block_number), Some(4));

  anchor_n(&chain, 2)?;
  let incremental = chain.verify_since_checkpoint()?;
  assert!(incremental.valid);
  assert_eq!(incremental.checked_from, 5);
  assert_eq!(incremental.checked_blocks, 2);
  assert_eq!(incremental.total_blocks, 7);
  assert_eq!(store.checkpoint()?.map(|cp| cp.block_number), Some(6));

  let tip_hash = chain.get_block_by_number(6)?.hash;
  anchor_n(&chain, 1)?;
  store.tamper_with(7, |b| b.nonce += 1);
  let report = chain.verify_since_checkpoint()?;
  assert_eq!(report.invalid_blocks, vec![7]);
  assert_eq!(store.checkpoint()?.map(|cp| cp.hash), Some(tip_hash));
  Ok(())
}

#[test]
fn test_tampered_checkpoint_block_forces_full_scan() -> anyhow::Result<()> {
  let store = Arc::new(MemoryStore::new());
  let chain = Chain::new(store.clone());
  anchor_n(&chain, 3)?;
  chain.verify_chain_integrity()?;

  store.tamper_with(3, |b| b.data_hash = "0".repeat(64));
  let report = chain.verify_since_checkpoint()?;
  assert_eq!(report.checked_from, 0);
  assert_eq!(report.invalid_blocks, vec![3]);
  Ok(())
}

#[test]
fn test_list_transactions_pagination_and_filters() -> anyhow::Result<()> {
  let chain = memory_chain();
  for i in 0..25 {
    let (record_type, actor) = if i % 5 == 0 {
      (RecordType::EmergencyAccess, "er-doc")
    } else {
      (RecordType::MedicalRecord, "lab-tech")
    };
    chain.anchor_record(
      record_type,
      &format!("MR-{i:03}"),
      &json!({ "i": i }),
      AnchorContext {
        actor_id: Some(actor.to_string()),
        subject_id: Some(format!("pt-{}", i % 2)),
        ..Default::default()
      },
    )?;
  }

  let all = TransactionFilter::default();
  let first = chain.list_transactions(&all, Some(1), Some(10))?;
  assert_eq!(first.total, 26);
  assert_eq!(first.total_pages, 3);
  let numbers: Vec<u64> = first.transactions.iter().map(|b| b.block_number).collect();
  assert_eq!(numbers, (16..=25).rev().collect::<Vec<u64>>());

  let last = chain.list_transactions(&all, Some(3), Some(10))?;
  assert_eq!(last.transactions.len(), 6);
  assert_eq!(last.transactions.last().map(|b| b.block_number), Some(0));

  let beyond = chain.list_transactions(&all, Some(9), Some(10))?;
  assert!(beyond.transactions.is_empty());
  assert_eq!(beyond.total, 26);

  let emergencies = chain.list_transactions(
    &TransactionFilter {
      record_type: Some(RecordType::EmergencyAccess),
      ..Default::default()
    },
    None,
    None,
  )?;
  assert_eq!(emergencies.total, 5);
  assert!(emergencies.transactions.iter().all(|b| b.user_id.as_deref() == Some("er-doc")));

  let by_actor_and_subject = chain.list_transactions(
    &TransactionFilter {
      actor_id: Some("lab-tech".to_string()),
      subject_id: Some("pt-1".to_string()),
      ..Default::default()
    },
    None,
    Some(100),
  )?;
  assert!(by_actor_and_subject
    .transactions
    .iter()
    .all(|b| b.subject_id.as_deref() == Some("pt-1") && b.user_id.as_deref() == Some("lab-tech")));
  assert_eq!(by_actor_and_subject.total, 10);

  let search = chain.list_transactions(
    &TransactionFilter {
      search: Some("mr-01".to_string()),
      ..Default::default()
    },
    None,
    None,
  )?;
  assert_eq!(search.total, 10);

  // Page size is clamped rather than rejected
  let clamped = chain.list_transactions(&all, Some(0), Some(0))?;
  assert_eq!(clamped.page, 1);
  assert_eq!(clamped.page_size, 1);
  assert_eq!(clamped.transactions.len(), 1);
  Ok(())
}

#[test]
fn test_record_history_and_consent_revocation() -> anyhow::Result<()> {
  let chain = memory_chain();
  let consent = |action| ConsentAnchor {
    id: "consent-7".to_string(),
    patient_id: "pt-7".to_string(),
    provider_id: "dr-7".to_string(),
    consent_type: "LAB_RESULTS".to_string(),
    action,
    actioned_at: None,
  };
  let granted = chain.anchor(consent(ConsentAction::Grant).into_anchor(Some("pt-7".to_string())))?;
  chain.anchor_record(RecordType::Appointment, "consent-70", &json!({}), AnchorContext::default())?;
  let revoked = chain.anchor(consent(ConsentAction::Revoke).into_anchor(Some("pt-7".to_string())))?;

  let history = chain.get_record_history("consent-7")?;
  assert_eq!(history.len(), 2);
  assert_eq!(history[0], granted);
  assert_eq!(history[1], revoked);
  assert_eq!(history[0].record_type, RecordType::ConsentGrant);
  assert_eq!(history[1].record_type, RecordType::ConsentRevoke);
  assert_eq!(history[1].subject_id.as_deref(), Some("pt-7"));

  assert!(chain.get_record_history("nobody")?.is_empty());
  Ok(())
}

#[test]
fn test_lookups_report_not_found() -> anyhow::Result<()> {
  let chain = memory_chain();
  anchor_n(&chain, 1)?;
  let tip = chain.get_block_by_number(1)?;
  assert_eq!(chain.get_block_by_hash(&tip.hash)?, tip);
  assert!(matches!(chain.get_block_by_number(42), Err(LedgerError::NotFound(_))));
  assert!(matches!(chain.get_block_by_hash("deadbeef"), Err(LedgerError::NotFound(_))));
  Ok(())
}

#[test]
fn test_parallel_mining_chain() -> anyhow::Result<()> {
  let config = LedgerConfig::default().with_difficulty(3).with_parallel_mining(true);
  let chain = memory_chain_with(config);
  anchor_n(&chain, 3)?;
  let report = chain.verify_chain_integrity()?;
  assert!(report.valid);
  for item in chain.store().blocks_from(0) {
    assert!(item?.hash.starts_with("000"));
  }
  Ok(())
}

#[test]
fn test_concurrent_anchors_stay_linear() -> anyhow::Result<()> {
  let (temp_dir, store) = create_temp_store();
  let chain = Chain::new(Arc::new(store.clone()));

  let handles: Vec<_> = (0..8)
    .map(|worker| {
      let chain = chain.clone();
      thread::spawn(move || {
        for i in 0..5 {
          chain
            .anchor_record(
              RecordType::AuditLog,
              &format!("W{worker}-{i}"),
              &json!({ "worker": worker, "i": i }),
              AnchorContext::default(),
            )
            .expect("anchor succeeds under the write lock");
        }
      })
    })
    .collect();
  for handle in handles {
    handle.join().expect("worker panicked");
  }

  assert_eq!(store.block_count()?, 41);
  let numbers: Vec<u64> = store.blocks_from(0).map(|b| b.unwrap().block_number).collect();
  assert_eq!(numbers, (0..41).collect::<Vec<u64>>());
  assert!(chain.verify_chain_integrity()?.valid);

  drop(chain);
  teardown_store(temp_dir, store);
  Ok(())
}

#[test]
fn test_independent_writers_never_share_a_block_number() -> anyhow::Result<()> {
  // Two services with separate write locks over one store, like two processes
  let store = Arc::new(MemoryStore::new());
  let config = LedgerConfig {
    max_append_attempts: 50,
    ..LedgerConfig::default()
  };
  Chain::new(store.clone()).ensure_genesis()?;

  let handles: Vec<_> = (0..2)
    .map(|writer| {
      let chain = Chain::with_config(store.clone(), config.clone());
      thread::spawn(move || {
        let mut committed = 0u64;
        for i in 0..10 {
          match chain.anchor_record(
            RecordType::AuditLog,
            &format!("P{writer}-{i}"),
            &json!({ "writer": writer, "i": i }),
            AnchorContext::default(),
          ) {
            Ok(_) => committed += 1,
            Err(err) => assert!(matches!(err, LedgerError::WriteConflict { .. })),
          }
        }
        committed
      })
    })
    .collect();
  let committed: u64 = handles.into_iter().map(|h| h.join().expect("writer panicked")).sum();

  assert_eq!(store.block_count()?, committed + 1);
  let report = Chain::new(store.clone()).verify_chain_integrity()?;
  assert!(report.valid, "{}", report.message);
  Ok(())
}

#[test]
fn test_sled_tamper_detected_after_raw_edit() -> anyhow::Result<()> {
  let (temp_dir, store) = create_temp_store();
  let chain = Chain::new(Arc::new(store.clone()));
  anchor_n(&chain, 5)?;
  assert!(chain.verify_chain_integrity()?.valid);

  let raw = store.raw_db().open_tree("blocks")?;
  let key = 3u64.to_be_bytes();
  let bytes = raw.get(key)?.expect("block 3 stored");
  let mut block: careledger_core::Block = bincode::deserialize(&bytes)?;
  block.nonce += 1;
  raw.insert(key, bincode::serialize(&block)?)?;

  let report = chain.verify_chain_integrity()?;
  assert_eq!(report.invalid_blocks, vec![3]);
  assert!(report.broken_links.is_empty());

  drop(chain);
  teardown_store(temp_dir, store);
  Ok(())
}

#[test]
fn test_sled_chain_survives_reopen() -> anyhow::Result<()> {
  let temp_dir = tempfile::tempdir()?;
  let path = temp_dir.path().to_path_buf();
  let tip = {
    let chain = Chain::new(Arc::new(SledStore::open(&path)?));
    anchor_n(&chain, 3)?;
    chain.get_block_by_number(3)?
  };

  let chain = Chain::new(Arc::new(SledStore::open(&path)?));
  assert_eq!(chain.store().tip()?, Some(tip.clone()));
  let next =
    chain.anchor_record(RecordType::AuditLog, "LOG-next", &json!({}), AnchorContext::default())?;
  assert_eq!(next.previous_hash, tip.hash);
  assert!(chain.verify_chain_integrity()?.valid);
  drop(chain);
  temp_dir.close()?;
  Ok(())
}

#[test]
fn test_random_payloads_verify_and_stay_linked() -> anyhow::Result<()> {
  use rand::{distributions::Alphanumeric, Rng};

  let chain = memory_chain_with(LedgerConfig::default().with_difficulty(1));
  let mut rng = rand::thread_rng();
  let mut anchored = Vec::new();
  for i in 0..25 {
    let note: String = (&mut rng).sample_iter(&Alphanumeric).take(32).map(char::from).collect();
    let payload = json!({ "note": note, "dose_mg": rng.gen_range(1..1000), "seq": i });
    let record_type = RecordType::ALL[rng.gen_range(0..RecordType::ALL.len())];
    let record_id = format!("RAND-{i}");
    let block = chain.anchor_record(record_type, &record_id, &payload, AnchorContext::default())?;
    assert_eq!(block.data_hash, hash_data(&payload)?);
    anchored.push(block);
  }

  for block in &anchored {
    let verification = chain.verify_record(&block.data_hash)?;
    assert!(verification.verified);
  }
  let report = chain.verify_chain_integrity()?;
  assert!(report.valid);
  assert_eq!(report.total_blocks, 26);
  Ok(())
}
