// This file is part of Ippoc Gate and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

/// Secret containers and their zeroization guarantees.
pub mod audit;
