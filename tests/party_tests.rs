use sharedstore::config::AppConfig;
use sharedstore::party::{NewParty, PartyKind, PartyUpdate, Role, RoleContext};
use sharedstore::{CallerContext, ConflictToken, SessionBinding, StoreError, StoreRuntime};
use tempfile::TempDir;

async fn bound_store(temp_dir: &TempDir) -> (StoreRuntime, SessionBinding) {
    let runtime = StoreRuntime::from_config(&AppConfig::default()).unwrap();
    let path = temp_dir.path().join("parties.db");
    let mut binding = runtime.binding(CallerContext::privileged("clerk"));
    runtime
        .selector()
        .provision(binding.context(), &path, None)
        .await
        .unwrap();
    runtime
        .selector()
        .select(&mut binding, &path)
        .await
        .unwrap();
    (runtime, binding)
}

#[tokio::test]
async fn test_unbound_session_cannot_touch_parties() {
    let runtime = StoreRuntime::from_config(&AppConfig::default()).unwrap();
    let binding = runtime.binding(CallerContext::new("nobody"));
    let result = runtime.parties().list(&binding).await;
    assert!(matches!(result, Err(StoreError::NotSelected)));
}

#[tokio::test]
async fn test_person_and_organization_share_roles() {
    let temp_dir = TempDir::new().unwrap();
    let (runtime, binding) = bound_store(&temp_dir).await;
    let parties = runtime.parties();

    let acme = parties
        .create(
            &binding,
            &NewParty {
                kind: PartyKind::Organization,
                display_name: "Acme".to_string(),
                email: Some("office@acme.test".to_string()),
                notes: None,
            },
        )
        .await
        .unwrap();
    let jane = parties
        .create(
            &binding,
            &NewParty {
                kind: PartyKind::Person,
                display_name: "Jane".to_string(),
                email: None,
                notes: None,
            },
        )
        .await
        .unwrap();

    let (acme_token, _) = parties
        .assign_role(&binding, acme.id, acme.token, Role::Supplier, &RoleContext::Global)
        .await
        .unwrap();
    let works_at_acme = RoleContext::Organization { party_id: acme.id };
    let (jane_token, _) = parties
        .assign_role(&binding, jane.id, jane.token, Role::Employee, &works_at_acme)
        .await
        .unwrap();
    let (jane_token, _) = parties
        .assign_role(&binding, jane.id, jane_token, Role::Customer, &RoleContext::Global)
        .await
        .unwrap();

    let acme = parties.get(&binding, acme.id).await.unwrap();
    assert_eq!(acme.token, acme_token);
    assert!(acme.has_role(Role::Supplier, &RoleContext::Global));

    let jane = parties.get(&binding, jane.id).await.unwrap();
    assert_eq!(jane.token, jane_token);
    assert_eq!(jane.token, ConflictToken(3));
    assert!(jane.has_role(Role::Employee, &works_at_acme));
    assert!(jane.has_role(Role::Customer, &RoleContext::Global));
    assert!(!jane.has_role(Role::Supplier, &RoleContext::Global));

    let all = parties.list(&binding).await.unwrap();
    let names: Vec<&str> = all.iter().map(|p| p.display_name.as_str()).collect();
    assert_eq!(names, vec!["Acme", "Jane"]);
    assert_eq!(all[1].roles.len(), 2);
}

#[tokio::test]
async fn test_duplicate_role_is_rejected_and_token_kept() {
    let temp_dir = TempDir::new().unwrap();
    let (runtime, binding) = bound_store(&temp_dir).await;
    let parties = runtime.parties();

    let party = parties
        .create(
            &binding,
            &NewParty {
                kind: PartyKind::Person,
                display_name: "Sam".to_string(),
                email: None,
                notes: None,
            },
        )
        .await
        .unwrap();
    let (token, _) = parties
        .assign_role(&binding, party.id, party.token, Role::Contact, &RoleContext::Global)
        .await
        .unwrap();

    let duplicate = parties
        .assign_role(&binding, party.id, token, Role::Contact, &RoleContext::Global)
        .await;
    assert!(matches!(duplicate, Err(StoreError::Database(_))));

    // The token advance was rolled back with the failed insert.
    let stored = parties.get(&binding, party.id).await.unwrap();
    assert_eq!(stored.token, token);
    assert_eq!(stored.roles.len(), 1);
}

#[tokio::test]
async fn test_update_and_remove_role() {
    let temp_dir = TempDir::new().unwrap();
    let (runtime, binding) = bound_store(&temp_dir).await;
    let parties = runtime.parties();

    let party = parties
        .create(
            &binding,
            &NewParty {
                kind: PartyKind::Person,
                display_name: "Kim".to_string(),
                email: Some("kim@old.test".to_string()),
                notes: None,
            },
        )
        .await
        .unwrap();

    let updated = parties
        .update(
            &binding,
            party.id,
            party.token,
            &PartyUpdate {
                email: Some(None),
                notes: Some(Some("prefers phone".to_string())),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.email, None);
    assert_eq!(updated.notes.as_deref(), Some("prefers phone"));
    assert_eq!(updated.display_name, "Kim");
    assert!(updated.last_modified >= party.last_modified);

    let (token, assignment) = parties
        .assign_role(
            &binding,
            party.id,
            updated.token,
            Role::Customer,
            &RoleContext::Project {
                code: "X-1".to_string(),
            },
        )
        .await
        .unwrap();
    let token = parties
        .remove_role(&binding, party.id, token, assignment.id)
        .await
        .unwrap();

    let stored = parties.get(&binding, party.id).await.unwrap();
    assert!(stored.roles.is_empty());
    assert_eq!(stored.token, token);

    let missing = parties
        .remove_role(&binding, party.id, token, assignment.id)
        .await;
    assert!(matches!(missing, Err(StoreError::RecordNotFound { .. })));
}

#[tokio::test]
async fn test_get_unknown_party() {
    let temp_dir = TempDir::new().unwrap();
    let (runtime, binding) = bound_store(&temp_dir).await;
    let result = runtime.parties().get(&binding, 999).await;
    assert!(matches!(
        result,
        Err(StoreError::RecordNotFound { key: 999, .. })
    ));
}
