//! PII Vault Demo
//!
//! Runs the envelope flow end to end with in-memory stores and a local KEK.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use pii_vault::{
    EnvelopeCoordinator, FieldLabels, InMemoryKeyStore, InMemoryPiiStore, KeyStore,
    LocalKeyWrapper, MemoryMetadataLogger, OrphanLedger, PiiStore, Reconciler, Sensitivity,
    StoreKind, VaultError,
};

fn b64(data: &[u8]) -> String {
    let encoded = STANDARD.encode(data);
    if encoded.len() > 16 {
        format!("{}...{}", &encoded[..8], &encoded[encoded.len() - 4..])
    } else {
        encoded
    }
}

fn section(title: &str) {
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("{}", title);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}

#[tokio::main]
async fn main() {
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║          PII VAULT DEMO - Envelope Encryption, 2 Stores      ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let pii = Arc::new(InMemoryPiiStore::new());
    let keys = Arc::new(InMemoryKeyStore::new());
    let ledger = Arc::new(OrphanLedger::new());
    let audit = Arc::new(MemoryMetadataLogger::new());
    let wrapper = Arc::new(LocalKeyWrapper::generate("master-kek"));
    let vault = EnvelopeCoordinator::new(
        Arc::clone(&pii),
        Arc::clone(&keys),
        wrapper,
        Arc::clone(&ledger),
        audit.clone(),
    );
    println!("📦 In-memory PII store, key store and local KEK ready");
    println!();

    // ========================================================================
    // Demo 1: Store and retrieve
    // ========================================================================
    section("📝 DEMO 1: Store and Retrieve a Field");

    let ssn = FieldLabels::new(42, "identity", "ssn", Sensitivity::Critical);
    let id = vault
        .store_field(ssn, "123-45-6789")
        .await
        .expect("store failed");
    println!("   Record ID: {}", id);

    let row = pii.fetch_field(&id).await.expect("fetch failed").expect("row missing");
    println!("   [PII STORE] Ciphertext: {}", b64(&row.ciphertext));
    println!("   [PII STORE] IV (12B):   {}", b64(&row.iv));
    println!("   [PII STORE] Tag (16B):  {}", b64(&row.auth_tag));

    let key_row = keys
        .fetch_wrapped_key(&id)
        .await
        .expect("fetch failed")
        .expect("row missing");
    println!("   [KEY STORE] Wrapped DEK: {}", b64(&key_row.wrapped.wrapped_key));
    println!("   [KEY STORE] KEK:         {}", key_row.wrapped.key_ref);

    let value = vault.retrieve_field(id).await.expect("retrieve failed");
    println!("   ✓ Retrieved: \"{}\"", value.as_str());
    println!();

    // ========================================================================
    // Demo 2: Several fields, one DEK each
    // ========================================================================
    section("📁 DEMO 2: Several Fields for One Owner");

    let ids = vault
        .store_fields(vec![
            (
                FieldLabels::new(42, "contact", "email", Sensitivity::Medium),
                "jane@example.com",
            ),
            (
                FieldLabels::new(42, "contact", "phone", Sensitivity::Low),
                "+1 555 0100",
            ),
        ])
        .await
        .expect("batch store failed");
    println!("   ✓ Stored {} fields", ids.len());

    for summary in vault.list_fields(42).await.expect("list failed") {
        println!(
            "   • {} / {} ({}) {}",
            summary.labels.category, summary.labels.field_name, summary.labels.sensitivity, summary.record_id
        );
    }
    println!();

    // ========================================================================
    // Demo 3: Tamper detection
    // ========================================================================
    section("🛡  DEMO 3: Tamper Detection");

    let mut tampered = row.clone();
    tampered.ciphertext[0] ^= 0x01;
    pii.delete_field(&id).await.expect("delete failed");
    pii.insert_field(&tampered).await.expect("insert failed");

    match vault.retrieve_field(id).await {
        Err(VaultError::Authentication) => println!("   ✓ Flipped bit rejected: authentication failed"),
        other => println!("   ✗ Unexpected result: {:?}", other.map(|_| "plaintext")),
    }

    pii.delete_field(&id).await.expect("delete failed");
    pii.insert_field(&row).await.expect("insert failed");
    println!();

    // ========================================================================
    // Demo 4: Update and delete
    // ========================================================================
    section("🔄 DEMO 4: Update (new DEK) and Delete");

    let new_id = vault
        .update_field(id, "987-65-4321")
        .await
        .expect("update failed");
    println!("   Old record: {}", id);
    println!("   New record: {}", new_id);
    let value = vault.retrieve_field(new_id).await.expect("retrieve failed");
    println!("   ✓ New value: \"{}\"", value.as_str());

    vault.delete_field(new_id).await.expect("delete failed");
    match vault.retrieve_field(new_id).await {
        Err(VaultError::RecordNotFound(_)) => println!("   ✓ Deleted record is gone"),
        other => println!("   ✗ Unexpected result: {:?}", other.map(|_| "plaintext")),
    }
    println!();

    // ========================================================================
    // Demo 5: Orphan cleanup
    // ========================================================================
    section("🧹 DEMO 5: Reconciliation of Orphaned Rows");

    let orphan = ids[0];
    keys.delete_wrapped_key(&orphan).await.expect("delete failed");
    ledger.note(orphan, StoreKind::Pii);
    println!("   Wrapped key for {} removed; ciphertext is now an orphan", orphan);

    let reconciler = Reconciler::new(
        Arc::clone(&pii),
        Arc::clone(&keys),
        Arc::clone(&ledger),
        std::time::Duration::from_secs(600),
    );
    let report = reconciler.sweep(Utc::now()).await.expect("sweep failed");
    println!("   ✓ {:?}", report);
    println!("   PII rows: {}, key rows: {}", pii.len(), keys.len());
    println!();

    // ========================================================================
    // Audit trail
    // ========================================================================
    section("📊 Audit Trail (labels only)");
    for line in audit.lines() {
        println!("   {}", line);
    }
    println!();

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                    DEMO COMPLETE! ✅                         ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
}
