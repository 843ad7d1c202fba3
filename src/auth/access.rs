use crate::error::Result;
use crate::store::Store;
use crate::types::{Privilege, Repo, User};

/// Effective privilege of `user` on `repo`: owners always write, everyone
/// else gets the higher of their direct and group grants. A missing grant is
/// absent rather than an explicit `none`, so `None` means no row on either
/// path.
pub fn effective_privilege(store: &dyn Store, user: &User, repo: &Repo) -> Result<Option<Privilege>> {
    if repo.owner_id == user.id {
        return Ok(Some(Privilege::Write));
    }
    let group = store.get_group_access_for_user(repo.id, user.id)?;
    let direct = store.get_user_access(repo.id, user.id)?;
    Ok(group.max(direct))
}

/// Anonymous callers pass `None` and only see public repositories.
pub fn has_read(store: &dyn Store, user: Option<&User>, repo: &Repo) -> Result<bool> {
    if repo.public {
        return Ok(true);
    }
    let Some(user) = user else {
        return Ok(false);
    };
    Ok(effective_privilege(store, user, repo)?.is_some_and(Privilege::allows_read))
}

pub fn has_write(store: &dyn Store, user: Option<&User>, repo: &Repo) -> Result<bool> {
    let Some(user) = user else {
        return Ok(false);
    };
    Ok(effective_privilege(store, user, repo)?.is_some_and(Privilege::allows_write))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    struct Fixture {
        store: SqliteStore,
        alice: User,
        bob: User,
        repo: Repo,
    }

    fn fixture() -> Fixture {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();
        let alice = store.create_user("alice", None).unwrap();
        let bob = store.create_user("bob", None).unwrap();
        let repo = store.create_repo(alice.id, "tools", "").unwrap();
        Fixture {
            store,
            alice,
            bob,
            repo,
        }
    }

    #[test]
    fn test_owner_always_writes() {
        let f = fixture();
        assert_eq!(
            effective_privilege(&f.store, &f.alice, &f.repo).unwrap(),
            Some(Privilege::Write)
        );
        assert!(has_write(&f.store, Some(&f.alice), &f.repo).unwrap());
    }

    #[test]
    fn test_stranger_and_anonymous() {
        let mut f = fixture();
        assert!(!has_read(&f.store, Some(&f.bob), &f.repo).unwrap());
        assert!(!has_read(&f.store, None, &f.repo).unwrap());

        f.repo.public = true;
        assert!(has_read(&f.store, None, &f.repo).unwrap());
        assert!(has_read(&f.store, Some(&f.bob), &f.repo).unwrap());
        assert!(!has_write(&f.store, Some(&f.bob), &f.repo).unwrap());
        assert!(!has_write(&f.store, None, &f.repo).unwrap());
    }

    #[test]
    fn test_group_grant_then_raise() {
        let f = fixture();
        let group = f.store.create_group(f.alice.id, "core", "").unwrap();
        f.store.add_group_member(f.alice.id, group.id, "bob").unwrap();
        f.store.add_group_access(f.alice.id, f.repo.id, "core").unwrap();

        assert!(has_read(&f.store, Some(&f.bob), &f.repo).unwrap());
        assert!(!has_write(&f.store, Some(&f.bob), &f.repo).unwrap());

        f.store
            .set_group_access(f.alice.id, f.repo.id, "core", Privilege::Write)
            .unwrap();
        assert!(has_write(&f.store, Some(&f.bob), &f.repo).unwrap());
    }

    #[test]
    fn test_explicit_none_does_not_revoke_group_read() {
        let f = fixture();
        let group = f.store.create_group(f.alice.id, "core", "").unwrap();
        f.store.add_group_member(f.alice.id, group.id, "bob").unwrap();
        f.store.add_group_access(f.alice.id, f.repo.id, "core").unwrap();
        f.store.add_user_access(f.alice.id, f.repo.id, "bob").unwrap();
        f.store
            .set_user_access(f.alice.id, f.repo.id, "bob", Privilege::None)
            .unwrap();

        assert_eq!(
            effective_privilege(&f.store, &f.bob, &f.repo).unwrap(),
            Some(Privilege::Read)
        );
    }

    #[test]
    fn test_direct_grant_above_group() {
        let f = fixture();
        let group = f.store.create_group(f.alice.id, "core", "").unwrap();
        f.store.add_group_member(f.alice.id, group.id, "bob").unwrap();
        f.store.add_group_access(f.alice.id, f.repo.id, "core").unwrap();
        f.store
            .set_group_access(f.alice.id, f.repo.id, "core", Privilege::None)
            .unwrap();
        f.store.add_user_access(f.alice.id, f.repo.id, "bob").unwrap();
        f.store
            .set_user_access(f.alice.id, f.repo.id, "bob", Privilege::Write)
            .unwrap();

        assert!(has_write(&f.store, Some(&f.bob), &f.repo).unwrap());
    }
}
