// SPDX-FileCopyrightText: 2025 runca contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Human-readable rendering of a parsed archive.
//!
//! Presentation only; every enum-to-string table lives here, nowhere else.

use std::fmt::Write;

use crate::header::{ContentType, DistributionType, EncryptionType, FormatType, HashType};
use crate::nca::NcaReader;

pub fn distribution_type_str(t: DistributionType) -> &'static str {
    match t {
        DistributionType::Download => "Download",
        DistributionType::GameCard => "Game Card",
        DistributionType::Unknown(_) => "Unknown",
    }
}

pub fn content_type_str(t: ContentType) -> &'static str {
    match t {
        ContentType::Program => "Program",
        ContentType::Meta => "Meta",
        ContentType::Control => "Control",
        ContentType::Manual => "Manual",
        ContentType::Data => "Data",
        ContentType::PublicData => "PublicData",
        ContentType::Unknown(_) => "Unknown",
    }
}

pub fn format_type_str(t: FormatType) -> &'static str {
    match t {
        FormatType::RomFs => "RomFs",
        FormatType::Pfs => "PartitionFs",
        FormatType::Unknown(_) => "Unknown",
    }
}

pub fn hash_type_str(t: HashType) -> &'static str {
    match t {
        HashType::Auto => "Auto",
        HashType::None => "None",
        HashType::HierarchicalSha256 => "HierarchicalSha256",
        HashType::HierarchicalIntegrity => "HierarchicalIntegrity",
        HashType::Unknown(_) => "Unknown",
    }
}

pub fn encryption_type_str(t: EncryptionType) -> &'static str {
    match t {
        EncryptionType::Auto => "Auto",
        EncryptionType::None => "None",
        EncryptionType::AesXts => "AesXts",
        EncryptionType::AesCtr => "AesCtr",
        EncryptionType::AesCtrEx => "AesCtrEx",
        EncryptionType::Unknown(_) => "Unknown",
    }
}

pub fn kaek_index_str(index: u8) -> &'static str {
    match index {
        0 => "Application",
        1 => "Ocean",
        2 => "System",
        _ => "Unknown",
    }
}

/// Render the header and partition summary of an opened archive.
pub fn describe(reader: &NcaReader) -> String {
    let header = reader.header();
    let mut out = String::new();

    let _ = writeln!(out, "[NCA Header]");
    let _ = writeln!(out, "  Format Type:     {}", header.version.as_str());
    let _ = writeln!(
        out,
        "  Dist. Type:      {}",
        distribution_type_str(header.distribution_type)
    );
    let _ = writeln!(
        out,
        "  Content Type:    {}",
        content_type_str(header.content_type)
    );
    let _ = writeln!(
        out,
        "  Key Generation:  {}",
        header.key_generation_old.max(header.key_generation)
    );
    let _ = writeln!(
        out,
        "  Kaek Index:      {} ({})",
        kaek_index_str(header.kaek_index),
        header.kaek_index
    );
    let _ = writeln!(out, "  Size:            0x{:X}", header.content_size);
    let _ = writeln!(out, "  ProgID:          0x{:016X}", header.program_id);
    let _ = writeln!(out, "  Content Index:   {}", header.content_index);
    let ver = header.sdk_addon_version;
    let _ = writeln!(
        out,
        "  SdkAddon Ver.:   v{} ({}.{}.{})",
        ver,
        (ver >> 24) & 0xFF,
        (ver >> 16) & 0xFF,
        (ver >> 8) & 0xFF
    );
    let _ = writeln!(out, "  RightsId:        {}", header.rights_id_hex());

    let body_keys = reader.body_keys();
    if !body_keys.key_area.is_empty() {
        let _ = writeln!(out, "  Key Area:");
        let _ = writeln!(
            out,
            "    | IDX | ENCRYPTED KEY                    | DECRYPTED KEY                    |"
        );
        for entry in &body_keys.key_area {
            let decrypted = match entry.decrypted {
                Some(key) => hex::encode(key),
                None => "<unable to decrypt>             ".to_string(),
            };
            let _ = writeln!(
                out,
                "    | {:3} | {} | {} |",
                entry.index,
                hex::encode(entry.encrypted),
                decrypted
            );
        }
    }

    let _ = writeln!(out, "  Partitions:");
    for partition in reader.partitions() {
        let _ = writeln!(out, "    {}:", partition.index);
        let _ = writeln!(out, "      Offset:      0x{:X}", partition.offset);
        let _ = writeln!(out, "      Size:        0x{:X}", partition.size);
        let _ = writeln!(
            out,
            "      Format Type: {}",
            format_type_str(partition.format_type)
        );
        let _ = writeln!(out, "      Hash Type:   {}", hash_type_str(partition.hash_type));
        let _ = writeln!(
            out,
            "      Enc. Type:   {}",
            encryption_type_str(partition.encryption_type)
        );
        if partition.encryption_type == EncryptionType::AesCtr {
            let _ = writeln!(out, "        AES-CTR:     {}", hex::encode(partition.ctr_iv));
        }
        if let Some(meta) = &partition.hash_meta {
            let _ = writeln!(
                out,
                "      {} Header:",
                hash_type_str(partition.hash_type)
            );
            for (i, layer) in meta.hash_layers.iter().enumerate() {
                let _ = writeln!(out, "        Hash Layer {i}:");
                let _ = writeln!(out, "          Offset:          0x{:X}", layer.offset);
                let _ = writeln!(out, "          Size:            0x{:X}", layer.size);
                let _ = writeln!(out, "          BlockSize:       0x{:X}", layer.block_size);
            }
            let _ = writeln!(out, "        Data Layer:");
            let _ = writeln!(out, "          Offset:          0x{:X}", meta.data_layer.offset);
            let _ = writeln!(out, "          Size:            0x{:X}", meta.data_layer.size);
            let _ = writeln!(
                out,
                "          BlockSize:       0x{:X}",
                meta.data_layer.block_size
            );
            for (i, hash) in meta.master_hashes.iter().enumerate() {
                let _ = writeln!(out, "        Master Hash {i}:     {}", hex::encode(hash));
            }
        }
        if let Some(reason) = &partition.fail_reason {
            let _ = writeln!(out, "      Not readable: {reason}");
        }
    }

    out
}
