// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::{AppError, AppResult};

#[derive(Debug, Clone)]
struct User {
    name: String,
    password: String,
    /// friend id -> friend name, one directional
    friends: BTreeMap<String, String>,
}

/// Registered users and their friend edges, kept in memory.
#[derive(Debug)]
pub struct UserDirectory {
    users: DashMap<String, User>,
    next_id: AtomicU64,
    id_step: u64,
}

impl UserDirectory {
    pub fn new(id_step: u64) -> Self {
        UserDirectory {
            users: DashMap::new(),
            next_id: AtomicU64::new(0),
            id_step: id_step.max(1),
        }
    }

    fn generate_id(&self) -> String {
        let id = self.next_id.fetch_add(self.id_step, Ordering::Relaxed) + self.id_step;
        id.to_string()
    }

    pub fn register(&self, name: &str, password: &str) -> AppResult<String> {
        if name.is_empty() {
            return Err(AppError::InvalidValue("username must not be empty".into()));
        }
        let id = self.generate_id();
        self.users.insert(
            id.clone(),
            User {
                name: name.to_string(),
                password: password.to_string(),
                friends: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    pub fn name_of(&self, user_id: &str) -> Option<String> {
        self.users.get(user_id).map(|u| u.name.clone())
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn authenticate(&self, user_id: &str, password: &str) -> AppResult<()> {
        let user = self
            .users
            .get(user_id)
            .ok_or_else(|| AppError::UserNotFound(user_id.to_string()))?;
        if user.password != password {
            return Err(AppError::PasswordMismatch(user_id.to_string()));
        }
        Ok(())
    }

    /// Removes the user and every friend edge pointing at it.
    pub fn delete(&self, user_id: &str) -> AppResult<()> {
        self.users
            .remove(user_id)
            .ok_or_else(|| AppError::UserNotFound(user_id.to_string()))?;
        for mut user in self.users.iter_mut() {
            user.friends.remove(user_id);
        }
        Ok(())
    }

    /// `(id, name)` of every user whose name contains `pattern`, by id.
    pub fn search(&self, pattern: &str) -> Vec<(String, String)> {
        let mut found: Vec<(String, String)> = self
            .users
            .iter()
            .filter(|entry| entry.name.contains(pattern))
            .map(|entry| (entry.key().clone(), entry.name.clone()))
            .collect();
        found.sort();
        found
    }

    pub fn add_friend(&self, user_id: &str, friend_id: &str) -> AppResult<()> {
        if user_id == friend_id {
            return Err(AppError::InvalidValue(format!(
                "user {} can not befriend itself",
                user_id
            )));
        }
        // read the friend first, never hold two entries of the map at once
        let friend_name = self
            .name_of(friend_id)
            .ok_or_else(|| AppError::UserNotFound(friend_id.to_string()))?;
        let mut user = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| AppError::UserNotFound(user_id.to_string()))?;
        user.friends.insert(friend_id.to_string(), friend_name);
        Ok(())
    }

    pub fn remove_friend(&self, user_id: &str, friend_id: &str) -> AppResult<()> {
        let mut user = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| AppError::UserNotFound(user_id.to_string()))?;
        user.friends.remove(friend_id);
        Ok(())
    }

    /// `(id, name)` of the user's friends, by id.
    pub fn friends(&self, user_id: &str) -> AppResult<Vec<(String, String)>> {
        let user = self
            .users
            .get(user_id)
            .ok_or_else(|| AppError::UserNotFound(user_id.to_string()))?;
        Ok(user
            .friends
            .iter()
            .map(|(id, name)| (id.clone(), name.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_generates_stepped_ids() {
        let directory = UserDirectory::new(100_000);
        assert_eq!(directory.register("alice", "pw").unwrap(), "100000");
        assert_eq!(directory.register("bob", "pw").unwrap(), "200000");
        assert!(directory.register("", "pw").is_err());
        assert_eq!(directory.len(), 2);
    }

    #[test]
    fn test_authenticate() {
        let directory = UserDirectory::new(1);
        let id = directory.register("alice", "secret").unwrap();
        assert!(directory.authenticate(&id, "secret").is_ok());
        assert!(matches!(
            directory.authenticate(&id, "nope"),
            Err(AppError::PasswordMismatch(_))
        ));
        assert!(matches!(
            directory.authenticate("404", "secret"),
            Err(AppError::UserNotFound(_))
        ));
    }

    #[test]
    fn test_friend_edges() {
        let directory = UserDirectory::new(1);
        let alice = directory.register("alice", "pw").unwrap();
        let bob = directory.register("bob", "pw").unwrap();
        let carol = directory.register("carol", "pw").unwrap();

        directory.add_friend(&alice, &bob).unwrap();
        directory.add_friend(&alice, &carol).unwrap();
        assert!(directory.add_friend(&alice, &alice).is_err());
        assert!(directory.add_friend(&alice, "404").is_err());
        assert_eq!(
            directory.friends(&alice).unwrap(),
            vec![(bob.clone(), "bob".to_string()), (carol.clone(), "carol".to_string())]
        );
        // edges are one directional
        assert!(directory.friends(&bob).unwrap().is_empty());

        directory.remove_friend(&alice, &bob).unwrap();
        directory.delete(&carol).unwrap();
        assert!(directory.friends(&alice).unwrap().is_empty());
        assert!(!directory.contains(&carol));
    }

    #[test]
    fn test_search_by_substring() {
        let directory = UserDirectory::new(1);
        directory.register("alice", "pw").unwrap();
        directory.register("malice", "pw").unwrap();
        directory.register("bob", "pw").unwrap();
        let names: Vec<String> = directory
            .search("lic")
            .into_iter()
            .map(|(_, name)| name)
            .collect();
        assert_eq!(names, vec!["alice".to_string(), "malice".to_string()]);
        assert!(directory.search("zed").is_empty());
    }
}
