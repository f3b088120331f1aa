/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! Computes the changes between two address snapshots.

use std::cmp::Ordering;

use super::Address;

/// A single change between two address snapshots.
#[derive(Debug, Clone)]
pub enum AddressChange {
    Add(Address),
    Delete(Address),
}

impl AddressChange {
    pub fn address(&self) -> &Address {
        match self {
            AddressChange::Add(address) | AddressChange::Delete(address) => address,
        }
    }
}

impl PartialEq for AddressChange {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (AddressChange::Add(a), AddressChange::Add(b))
            | (AddressChange::Delete(a), AddressChange::Delete(b)) => a == b && a.same_metadata(b),
            _ => false,
        }
    }
}

fn compare(a: &Address, b: &Address) -> Ordering {
    a.address
        .cmp(&b.address)
        .then_with(|| a.network_type.cmp(b.network_type))
}

/// Returns the changes that turn `old` into `new`.
///
/// Both sides are sorted by address and walked in step.  An address whose
/// metadata changed produces a Delete of the old entry followed by an Add of
/// the new one.  Order within a snapshot does not matter.
pub fn diff(old: &[Address], new: &[Address]) -> Vec<AddressChange> {
    let mut old: Vec<&Address> = old.iter().collect();
    let mut new: Vec<&Address> = new.iter().collect();
    old.sort_by(|a, b| compare(a, b));
    new.sort_by(|a, b| compare(a, b));

    let mut changes = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < old.len() && j < new.len() {
        match compare(old[i], new[j]) {
            Ordering::Less => {
                changes.push(AddressChange::Delete(old[i].clone()));
                i += 1;
            }
            Ordering::Greater => {
                changes.push(AddressChange::Add(new[j].clone()));
                j += 1;
            }
            Ordering::Equal => {
                if !old[i].same_metadata(new[j]) {
                    changes.push(AddressChange::Delete(old[i].clone()));
                    changes.push(AddressChange::Add(new[j].clone()));
                }
                i += 1;
                j += 1;
            }
        }
    }
    changes.extend(old[i..].iter().map(|a| AddressChange::Delete((*a).clone())));
    changes.extend(new[j..].iter().map(|a| AddressChange::Add((*a).clone())));
    changes
}

/// Applies `changes` to `addresses`.  A Delete removes one matching entry.
pub fn apply(addresses: &[Address], changes: &[AddressChange]) -> Vec<Address> {
    let mut result = addresses.to_vec();
    for change in changes {
        match change {
            AddressChange::Add(address) => result.push(address.clone()),
            AddressChange::Delete(address) => {
                if let Some(pos) = result
                    .iter()
                    .position(|a| a == address && a.same_metadata(address))
                {
                    result.remove(pos);
                }
            }
        }
    }
    result
}
